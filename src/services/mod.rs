pub mod backend;
pub mod dispatcher;
pub mod local_store;
pub mod memory_store;
pub mod naming;
pub mod s3_store;
pub mod shutdown;
pub mod uploader;
