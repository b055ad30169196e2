pub mod archive;
pub mod daemon;
pub mod model;
pub mod remote;
pub mod store;
pub mod sync;
pub mod token_provider;
