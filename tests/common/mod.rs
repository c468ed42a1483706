//! Shared helpers for the integration scenarios.

// Each scenario binary uses its own subset of these helpers.
#![allow(dead_code)]

use heliodb::model::{ClassDescriptor, PropertyDescriptor, PropertyKind};
use heliodb::{
    AssemblyBundle, Database, DatabaseConfig, ModelDescriptor, PropertyBlock, PropertyValue,
};
use std::path::Path;
use std::sync::Arc;

/// Class id of `Book` in the test model.
pub const BOOK: u16 = 1;

/// A minimal model: one `Book` class with `Title` and `Author`.
pub fn book_model() -> ModelDescriptor {
    let mut model = ModelDescriptor::empty();
    model.version = 1;
    model.classes.push(ClassDescriptor {
        id: BOOK,
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
                kind: PropertyKind::Str,
            },
        ],
        log_stream: 0,
    });
    model
}

/// Open a standalone database over `dir` with the book model.
pub fn open_db(node: &str, dir: &Path) -> Arc<Database> {
    Database::open(
        DatabaseConfig::standalone(node, dir),
        AssemblyBundle::for_model(book_model()),
    )
    .expect("open database")
}

/// A book property block.
pub fn book(title: &str, author: &str) -> PropertyBlock {
    PropertyBlock::new(vec![
        PropertyValue::string(title),
        PropertyValue::string(author),
    ])
}

/// Title of a book block.
pub fn title_of(block: &PropertyBlock) -> String {
    block
        .get(0)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_default()
}

/// Author of a book block.
pub fn author_of(block: &PropertyBlock) -> String {
    block
        .get(1)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_default()
}
