pub mod cleanup;
pub mod optimizer;
pub mod storage;
pub mod transcoder;
pub mod worker;
