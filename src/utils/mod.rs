pub mod file_retainer;
pub mod thread_pool;

/// Random identifier for an epoch: a continuous line of commits on one
/// primary. Changes when a node is promoted.
pub fn generate_epoch_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
