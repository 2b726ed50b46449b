pub mod processor;

pub use processor::RuleProcessor;
