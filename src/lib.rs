pub mod cli;
pub mod format;
pub mod genome;
pub mod homer;
pub mod ingest;
pub mod reader;
pub mod sparse;
pub mod utils;
pub mod writer;
