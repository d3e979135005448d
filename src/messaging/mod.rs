pub mod envelope;
pub mod message;
pub mod system_types;
