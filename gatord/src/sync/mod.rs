pub mod backoff;
pub mod changes;
pub mod download;
pub mod lease;
pub mod roots;
pub mod tags;

#[cfg(test)]
pub(crate) mod testutil;
