//! Engine context: process-wide singletons behind one explicit handle.
//!
//! The interned string table, the blob store, and the runtime trace level
//! are unavoidable globals. They are wrapped in a single `EngineContext`
//! initialized once and handed to every component, so nothing else in the
//! codebase reaches for ambient state directly.

use crate::blob::BlobStore;
use crate::intern::StringTable;
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU8, Ordering};

/// Runtime trace verbosity, adjustable through the administration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TraceLevel {
    /// Errors only.
    Error = 0,
    /// Warnings and errors.
    Warn = 1,
    /// Operational messages.
    Info = 2,
    /// Per-operation detail.
    Debug = 3,
    /// Everything, including wire frames.
    Verbose = 4,
}

impl TraceLevel {
    /// Decode from the wire representation.
    pub fn from_u8(v: u8) -> Option<TraceLevel> {
        match v {
            0 => Some(TraceLevel::Error),
            1 => Some(TraceLevel::Warn),
            2 => Some(TraceLevel::Info),
            3 => Some(TraceLevel::Debug),
            4 => Some(TraceLevel::Verbose),
            _ => None,
        }
    }
}

static GLOBAL: Lazy<EngineContext> = Lazy::new(EngineContext::new);

/// The process-wide engine context.
pub struct EngineContext {
    strings: StringTable,
    blobs: BlobStore,
    trace_level: AtomicU8,
    user_trace_level: AtomicU8,
}

impl EngineContext {
    fn new() -> Self {
        EngineContext {
            strings: StringTable::new(),
            blobs: BlobStore::new(),
            trace_level: AtomicU8::new(TraceLevel::Info as u8),
            user_trace_level: AtomicU8::new(TraceLevel::Warn as u8),
        }
    }

    /// The singleton context, initialized on first use.
    pub fn global() -> &'static EngineContext {
        &GLOBAL
    }

    /// The interned string table.
    pub fn strings(&self) -> &StringTable {
        &self.strings
    }

    /// The blob store.
    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    /// Current engine trace level.
    pub fn trace_level(&self) -> TraceLevel {
        TraceLevel::from_u8(self.trace_level.load(Ordering::Relaxed)).unwrap_or(TraceLevel::Info)
    }

    /// Set the engine trace level.
    pub fn set_trace_level(&self, level: TraceLevel) {
        self.trace_level.store(level as u8, Ordering::Relaxed);
    }

    /// Current user-code trace level.
    pub fn user_trace_level(&self) -> TraceLevel {
        TraceLevel::from_u8(self.user_trace_level.load(Ordering::Relaxed))
            .unwrap_or(TraceLevel::Warn)
    }

    /// Set the user-code trace level.
    pub fn set_user_trace_level(&self, level: TraceLevel) {
        self.user_trace_level.store(level as u8, Ordering::Relaxed);
    }
}
