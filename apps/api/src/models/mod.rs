pub mod enhancement;
pub mod source;
