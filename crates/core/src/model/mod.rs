//! The typed object model: class, property, and index descriptors.
//!
//! A `ModelDescriptor` is the versioned schema the engine dispatches on.
//! Descriptors are immutable once installed; a model update installs a new
//! descriptor with a fresh version GUID while transactions already running
//! keep their pinned `Arc` to the old one.

mod key;

pub use key::{IndexKey, KeyRange};

use crate::error::{ConfigKind, ConstraintKind, Error, Result};
use crate::types::{ClassId, IndexId, ObjectId, PropertyId, MAX_CLASS_ID};
use crate::value::{PropertyBlock, PropertyValue};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The type of a property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Boolean.
    Bool,
    /// Signed 8-bit integer.
    I8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// Unsigned 8-bit integer.
    U8,
    /// Unsigned 16-bit integer.
    U16,
    /// Unsigned 32-bit integer.
    U32,
    /// Unsigned 64-bit integer.
    U64,
    /// 32-bit float.
    F32,
    /// 64-bit float.
    F64,
    /// Interned string.
    Str,
    /// Out-of-line blob.
    Blob,
    /// Reference to an object of `target`.
    Reference {
        /// The referenced class.
        target: ClassId,
        /// Whether the null reference is a legal value.
        nullable: bool,
    },
    /// Array of a scalar element kind.
    Array(Box<PropertyKind>),
}

impl PropertyKind {
    /// Whether `value` is a legal instance of this kind.
    pub fn admits(&self, value: &PropertyValue) -> bool {
        match (self, value) {
            (_, PropertyValue::Null) => !matches!(
                self,
                PropertyKind::Reference { nullable: false, .. }
            ),
            (PropertyKind::Bool, PropertyValue::Bool(_)) => true,
            (PropertyKind::I8, PropertyValue::I8(_)) => true,
            (PropertyKind::I16, PropertyValue::I16(_)) => true,
            (PropertyKind::I32, PropertyValue::I32(_)) => true,
            (PropertyKind::I64, PropertyValue::I64(_)) => true,
            (PropertyKind::U8, PropertyValue::U8(_)) => true,
            (PropertyKind::U16, PropertyValue::U16(_)) => true,
            (PropertyKind::U32, PropertyValue::U32(_)) => true,
            (PropertyKind::U64, PropertyValue::U64(_)) => true,
            (PropertyKind::F32, PropertyValue::F32(_)) => true,
            (PropertyKind::F64, PropertyValue::F64(_)) => true,
            (PropertyKind::Str, PropertyValue::Str(_)) => true,
            (PropertyKind::Blob, PropertyValue::Blob(_)) => true,
            (PropertyKind::Reference { .. }, PropertyValue::Ref(_)) => true,
            (PropertyKind::Array(elem), PropertyValue::Array(items)) => {
                items.iter().all(|i| elem.admits(i))
            }
            _ => false,
        }
    }
}

/// A property of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyDescriptor {
    /// Stable property id within the class.
    pub id: PropertyId,
    /// Property name.
    pub name: String,
    /// Property type.
    pub kind: PropertyKind,
}

/// The index access structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Point lookups.
    Hash,
    /// Range scans.
    Sorted,
}

/// A secondary index over one class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    /// Stable index id.
    pub id: IndexId,
    /// Index name.
    pub name: String,
    /// Indexed class.
    pub class_id: ClassId,
    /// Access structure.
    pub kind: IndexKind,
    /// Reject duplicate keys at commit time.
    pub unique: bool,
    /// Key property ids in key order.
    pub properties: Vec<PropertyId>,
}

/// Declares that the engine maintains a back-edge index for a reference
/// property, answering "who points at X".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InverseRefDescriptor {
    /// The class holding the reference property.
    pub referring_class: ClassId,
    /// The reference property.
    pub property: PropertyId,
    /// The class being referenced.
    pub referenced_class: ClassId,
}

/// A class in the object model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassDescriptor {
    /// Stable class id; also the high bits of this class's object ids.
    pub id: ClassId,
    /// Class name.
    pub name: String,
    /// Properties in declared (block) order.
    pub properties: Vec<PropertyDescriptor>,
    /// The log stream this class persists to. Stream 0 is the main stream.
    pub log_stream: u8,
}

impl ClassDescriptor {
    /// Position of a property in the packed block.
    pub fn property_position(&self, property: PropertyId) -> Option<usize> {
        self.properties.iter().position(|p| p.id == property)
    }

    /// Look up a property by name.
    pub fn property_by_name(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// The versioned schema the engine runs against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// All classes, unique by id and name.
    pub classes: Vec<ClassDescriptor>,
    /// All secondary indexes.
    pub indexes: Vec<IndexDescriptor>,
    /// All inverse-reference declarations.
    pub inverse_refs: Vec<InverseRefDescriptor>,
    /// Changes exactly once per effective model update.
    pub model_guid: Uuid,
    /// Monotonic model version.
    pub version: u32,
}

impl ModelDescriptor {
    /// An empty model.
    pub fn empty() -> Self {
        ModelDescriptor {
            classes: Vec::new(),
            indexes: Vec::new(),
            inverse_refs: Vec::new(),
            model_guid: Uuid::new_v4(),
            version: 0,
        }
    }

    /// Look up a class by id.
    pub fn class(&self, id: ClassId) -> Result<&ClassDescriptor> {
        self.classes
            .iter()
            .find(|c| c.id == id)
            .ok_or(Error::NotFound(crate::error::NotFoundKind::Class(id)))
    }

    /// Look up a class by name.
    pub fn class_by_name(&self, name: &str) -> Option<&ClassDescriptor> {
        self.classes.iter().find(|c| c.name == name)
    }

    /// Look up an index by id.
    pub fn index(&self, id: IndexId) -> Result<&IndexDescriptor> {
        self.indexes
            .iter()
            .find(|i| i.id == id)
            .ok_or(Error::NotFound(crate::error::NotFoundKind::Index(id)))
    }

    /// All indexes over `class`.
    pub fn indexes_for_class(&self, class: ClassId) -> impl Iterator<Item = &IndexDescriptor> {
        self.indexes.iter().filter(move |i| i.class_id == class)
    }

    /// All inverse-reference declarations whose referring class is `class`.
    pub fn inverse_refs_from(&self, class: ClassId) -> impl Iterator<Item = &InverseRefDescriptor> {
        self.inverse_refs
            .iter()
            .filter(move |r| r.referring_class == class)
    }

    /// Structural validation of the whole model.
    pub fn validate(&self) -> Result<()> {
        let mut class_ids: FxHashMap<ClassId, &str> = FxHashMap::default();
        for class in &self.classes {
            if class.id > MAX_CLASS_ID {
                return Err(Error::Configuration(ConfigKind::OutOfRange {
                    field: format!("class '{}' id", class.name),
                }));
            }
            if class_ids.insert(class.id, &class.name).is_some() {
                return Err(Error::Configuration(ConfigKind::DuplicateName(
                    class.name.clone(),
                )));
            }
            let mut prop_ids = FxHashMap::default();
            for prop in &class.properties {
                if prop_ids.insert(prop.id, ()).is_some() {
                    return Err(Error::Configuration(ConfigKind::DuplicateName(format!(
                        "{}.{}",
                        class.name, prop.name
                    ))));
                }
            }
        }
        for index in &self.indexes {
            let class = self.class(index.class_id)?;
            for prop in &index.properties {
                let position = class.property_position(*prop).ok_or_else(|| {
                    Error::Configuration(ConfigKind::InvalidName(format!(
                        "index '{}' references unknown property {prop}",
                        index.name
                    )))
                })?;
                if matches!(
                    class.properties[position].kind,
                    PropertyKind::Blob | PropertyKind::Array(_)
                ) {
                    return Err(Error::Configuration(ConfigKind::InvalidName(format!(
                        "index '{}' keys on a non-scalar property",
                        index.name
                    ))));
                }
            }
        }
        for inv in &self.inverse_refs {
            let class = self.class(inv.referring_class)?;
            let position = class.property_position(inv.property).ok_or_else(|| {
                Error::Configuration(ConfigKind::InvalidName(format!(
                    "inverse reference on unknown property {}",
                    inv.property
                )))
            })?;
            match &class.properties[position].kind {
                PropertyKind::Reference { target, .. } if *target == inv.referenced_class => {}
                _ => {
                    return Err(Error::Constraint(ConstraintKind::InverseReferenceMismatch(
                        ObjectId::NULL,
                    )))
                }
            }
        }
        Ok(())
    }

    /// Check a property block against a class's declared kinds.
    pub fn check_block(&self, class_id: ClassId, block: &PropertyBlock) -> Result<()> {
        let class = self.class(class_id)?;
        if block.len() != class.properties.len() {
            return Err(Error::InvalidArgument {
                field: class.name.clone(),
                reason: format!(
                    "expected {} properties, got {}",
                    class.properties.len(),
                    block.len()
                ),
            });
        }
        for (prop, value) in class.properties.iter().zip(block.values()) {
            if matches!(
                (&prop.kind, value),
                (PropertyKind::Reference { nullable: false, .. }, PropertyValue::Null)
            ) || matches!(
                (&prop.kind, value),
                (PropertyKind::Reference { nullable: false, .. }, PropertyValue::Ref(ObjectId::NULL))
            ) {
                return Err(Error::Constraint(ConstraintKind::ReferenceNotNullable));
            }
            if !prop.kind.admits(value) {
                return Err(Error::InvalidArgument {
                    field: format!("{}.{}", class.name, prop.name),
                    reason: "value does not match declared property kind".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Extract an index key from a block.
    pub fn extract_key(&self, index: &IndexDescriptor, block: &PropertyBlock) -> Result<IndexKey> {
        let class = self.class(index.class_id)?;
        let mut key = IndexKey::builder();
        for prop_id in &index.properties {
            let position = class.property_position(*prop_id).ok_or_else(|| {
                Error::Configuration(ConfigKind::InvalidName(format!(
                    "index '{}' property {prop_id}",
                    index.name
                )))
            })?;
            let value = block.get(position).unwrap_or(&PropertyValue::Null);
            key.push(value)?;
        }
        Ok(key.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book_model() -> ModelDescriptor {
        ModelDescriptor {
            classes: vec![
                ClassDescriptor {
                    id: 1,
                    name: "Book".to_string(),
                    properties: vec![
                        PropertyDescriptor {
                            id: 0,
                            name: "Title".to_string(),
                            kind: PropertyKind::Str,
                        },
                        PropertyDescriptor {
                            id: 1,
                            name: "Author".to_string(),
                            kind: PropertyKind::Reference { target: 2, nullable: false },
                        },
                    ],
                    log_stream: 0,
                },
                ClassDescriptor {
                    id: 2,
                    name: "Author".to_string(),
                    properties: vec![PropertyDescriptor {
                        id: 0,
                        name: "Name".to_string(),
                        kind: PropertyKind::Str,
                    }],
                    log_stream: 0,
                },
            ],
            indexes: vec![IndexDescriptor {
                id: 1,
                name: "BookByTitle".to_string(),
                class_id: 1,
                kind: IndexKind::Sorted,
                unique: false,
                properties: vec![0],
            }],
            inverse_refs: vec![InverseRefDescriptor {
                referring_class: 1,
                property: 1,
                referenced_class: 2,
            }],
            model_guid: Uuid::new_v4(),
            version: 1,
        }
    }

    #[test]
    fn valid_model_passes() {
        book_model().validate().unwrap();
    }

    #[test]
    fn duplicate_class_id_rejected() {
        let mut model = book_model();
        model.classes[1].id = 1;
        assert!(matches!(
            model.validate(),
            Err(Error::Configuration(ConfigKind::DuplicateName(_)))
        ));
    }

    #[test]
    fn index_on_non_scalar_property_rejected() {
        let mut model = book_model();
        model.classes[0].properties.push(PropertyDescriptor {
            id: 2,
            name: "Cover".to_string(),
            kind: PropertyKind::Blob,
        });
        model.indexes.push(IndexDescriptor {
            id: 2,
            name: "BookByCover".to_string(),
            class_id: 1,
            kind: IndexKind::Hash,
            unique: false,
            properties: vec![2],
        });
        assert!(matches!(
            model.validate(),
            Err(Error::Configuration(ConfigKind::InvalidName(_)))
        ));
    }

    #[test]
    fn inverse_ref_must_target_reference_property() {
        let mut model = book_model();
        model.inverse_refs[0].property = 0; // Title is a string
        assert!(matches!(
            model.validate(),
            Err(Error::Constraint(ConstraintKind::InverseReferenceMismatch(_)))
        ));
    }

    #[test]
    fn check_block_enforces_kinds_and_arity() {
        let model = book_model();
        let good = PropertyBlock::new(vec![
            PropertyValue::string("Gatsby"),
            PropertyValue::Ref(ObjectId::new(2, 1)),
        ]);
        model.check_block(1, &good).unwrap();

        let short = PropertyBlock::new(vec![PropertyValue::string("Gatsby")]);
        assert!(model.check_block(1, &short).is_err());

        let wrong_kind = PropertyBlock::new(vec![
            PropertyValue::I64(1),
            PropertyValue::Ref(ObjectId::new(2, 1)),
        ]);
        assert!(model.check_block(1, &wrong_kind).is_err());
    }

    #[test]
    fn non_nullable_reference_rejects_null() {
        let model = book_model();
        let block = PropertyBlock::new(vec![
            PropertyValue::string("Gatsby"),
            PropertyValue::Ref(ObjectId::NULL),
        ]);
        assert_eq!(
            model.check_block(1, &block),
            Err(Error::Constraint(ConstraintKind::ReferenceNotNullable))
        );
    }

    #[test]
    fn key_extraction_follows_declared_order() {
        let model = book_model();
        let index = model.index(1).unwrap();
        let a = model
            .extract_key(index, &PropertyBlock::new(vec![
                PropertyValue::string("Alpha"),
                PropertyValue::Ref(ObjectId::new(2, 1)),
            ]))
            .unwrap();
        let b = model
            .extract_key(index, &PropertyBlock::new(vec![
                PropertyValue::string("Beta"),
                PropertyValue::Ref(ObjectId::new(2, 1)),
            ]))
            .unwrap();
        assert!(a < b);
    }
}
