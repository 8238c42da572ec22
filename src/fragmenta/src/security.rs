//! The block-payload encryption hooks (§6). The security manager itself
//! is an external collaborator — the core only fixes the two-method
//! contract and calls it if one is registered.

/// Implemented by a caller-supplied security manager. `block_id` is passed
/// as additional authenticated data for both directions.
pub trait SecurityManager: Send + Sync {
    fn encrypt(&self, block_id: u32, payload: &[u8]) -> std::io::Result<Vec<u8>>;
    fn decrypt(&self, block_id: u32, payload: &[u8]) -> std::io::Result<Vec<u8>>;
}
