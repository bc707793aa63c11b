//! Topic schemas and structural matching.
//!
//! A schema is a JSON object used as a structural template: only property
//! names and the nesting of object-valued properties matter. It is a hint
//! for publishers, not a type system.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One versioned schema for a topic. Versions start at 0 and grow by one
/// per update; old versions are never removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub version: u32,
    pub schema: Map<String, Value>,
}

/// What a client gets to know about a topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub name: String,
    pub schema: SchemaDescriptor,
}

/// Structural comparison of two JSON objects.
///
/// They match iff they have the same set of property names and, wherever
/// both sides hold objects, those objects recursively match. A property
/// that is an object on one side and not on the other is a mismatch;
/// arrays and scalars match by presence alone, ignoring value and element
/// type.
pub fn shapes_match(a: &Map<String, Value>, b: &Map<String, Value>) -> bool {
    if a.len() != b.len() {
        return false;
    }

    a.iter().all(|(key, a_value)| match b.get(key) {
        None => false,
        Some(b_value) => match (a_value.as_object(), b_value.as_object()) {
            (Some(a_obj), Some(b_obj)) => shapes_match(a_obj, b_obj),
            (Some(_), None) | (None, Some(_)) => false,
            (None, None) => true,
        },
    })
}
