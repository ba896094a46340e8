//! SSH module - connection chains, host trust and authentication prompts
//!
//! # Features
//! - Direct SSH connections
//! - ProxyJump (jump host) chains, tunnelled hop by hop over `direct-tcpip`
//! - Trust-on-first-use host key verification, per host and algorithm
//! - Keyboard-Interactive authentication (2FA) through a prompt broker

mod chain;
mod client;
mod config;
mod error;
pub mod prompt;
mod transport;
pub mod trust;

pub use chain::{connect_chain, ChainResolver, ConnectionChain, JumpHost, ProfileChainResolver};
pub use client::{ClientHandler, RusshLink, RusshTerminal, RusshTransport};
pub use config::{AuthMethod, CredentialBook, HopDescriptor, HostId, SshTarget};
pub use error::ConnectError;
pub use prompt::{
    HostKeyPrompt, HostKeyRequest, KbiPrompt, KeyboardInteractivePrompt, PromptChannel,
    PromptReply, PromptRequest, PromptSet,
};
pub use transport::{
    ChainConnection, Connection, HopCallbacks, SerialTransport, SshLink, SshTransport, TunnelIo,
    TunnelStream,
};
pub use trust::{
    fingerprint_sha256, FileTrustStore, FingerprintRecord, MemoryTrustStore, PresentedHostKey,
    TofuVerifier, TrustStore, TrustStoreError,
};
