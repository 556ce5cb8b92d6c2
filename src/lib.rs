/// fedops - operations CLI for a federated chat + forum deployment
///
/// Backup, restore and health checking for two Docker Compose stacks, each
/// composed of an application, a PostgreSQL database, a Redis cache and a
/// background worker.

pub mod cli;
pub mod core;
pub mod utils;
