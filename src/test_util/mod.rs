//! Helpers for tests that need connected communicators or canned handlers.

pub mod comm;
