//! Encrypted, scope-prefixed RPC shared by the daemon and sessions.

pub mod encryption;
pub mod manager;

pub use encryption::{Cipher, CodecError, EncryptionContext, EncryptionVariant, IdentityCipher};
pub use manager::{HandlerFuture, RpcErrorCode, RpcErrorEnvelope, RpcHandlerManager, RpcRequest};
