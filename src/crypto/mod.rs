pub mod key_management;
pub mod signatures;

pub use key_management::{spawn_keyring_watcher, KeyManager, KeyMetadata, KeyProvider, KeyStatus};
pub use signatures::{SignatureManager, Signer, Verifier};
