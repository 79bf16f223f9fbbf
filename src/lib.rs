pub mod archive;
pub mod config;
pub mod db;
pub mod monitoring;
pub mod notifications;

#[cfg(test)]
mod test_support;
