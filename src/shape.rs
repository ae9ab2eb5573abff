//! Store facades: the shape policies that specialize the engine.
//!
//! Each facade fixes two decisions the engine leaves open: whether a raw
//! persisted payload is well-formed for its kind of cell, and which equality
//! the dedup gate uses. Collection and document cells compare the serialized
//! form structurally (no `PartialEq` bound on user types); scalar cells
//! compare values directly.

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::cell::{Cell, CellOptions};
use crate::equality::structural_eq;

/// Shape policy: per-facade admission and equality.
pub trait Shape<T>: Send + Sync {
    /// Whether a raw persisted payload is well-formed for this cell kind.
    fn admits(&self, raw: &Value) -> bool;

    /// Equality used by the dedup gate.
    fn equals(&self, a: &T, b: &T) -> bool;
}

fn serialized_eq<T: Serialize>(a: &T, b: &T) -> bool {
    match (serde_json::to_value(a), serde_json::to_value(b)) {
        (Ok(a), Ok(b)) => structural_eq(&a, &b),
        // Unserializable values never count as duplicates.
        _ => false,
    }
}

/// Collection cells hold arrays; an empty array is well-formed.
pub struct CollectionShape;

impl<T: Serialize> Shape<Vec<T>> for CollectionShape {
    fn admits(&self, raw: &Value) -> bool {
        raw.is_array()
    }

    fn equals(&self, a: &Vec<T>, b: &Vec<T>) -> bool {
        serialized_eq(a, b)
    }
}

/// Document cells hold record-like values that serialize to a JSON object.
pub struct DocumentShape;

impl<T: Serialize> Shape<T> for DocumentShape {
    fn admits(&self, raw: &Value) -> bool {
        raw.is_object()
    }

    fn equals(&self, a: &T, b: &T) -> bool {
        serialized_eq(a, b)
    }
}

/// Scalar cells hold any non-null value, compared with `PartialEq`.
pub struct ScalarShape;

impl<T: PartialEq> Shape<T> for ScalarShape {
    fn admits(&self, raw: &Value) -> bool {
        !raw.is_null()
    }

    fn equals(&self, a: &T, b: &T) -> bool {
        a == b
    }
}

/// Construct a collection-valued cell.
pub fn collection<T>(options: CellOptions<Vec<T>>) -> Cell<Vec<T>>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Cell::with_shape(options, Arc::new(CollectionShape))
}

/// Construct a structured-object-valued cell.
pub fn document<T>(options: CellOptions<T>) -> Cell<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Cell::with_shape(options, Arc::new(DocumentShape))
}

/// Construct a scalar-valued cell.
pub fn scalar<T>(options: CellOptions<T>) -> Cell<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    Cell::with_shape(options, Arc::new(ScalarShape))
}
