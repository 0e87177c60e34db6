//! Request/response overlay for NIP-46 (remote signing) and NIP-47
//! (wallet service), built on correlated RPC over the relay fabric
//! (§4.G).

pub mod nip46;
pub mod nip47;
pub mod rate_limiter;
pub mod rpc;
pub mod uri;

pub use nip46::RemoteSignerClient;
pub use nip47::WalletClient;
pub use rpc::{RpcChannel, RpcRequest, RpcResponse};
