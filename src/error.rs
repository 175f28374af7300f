use crate::state::ConnectionState;

/// Errors surfaced by channel adapters and the channel manager.
///
/// Send-family errors are deliberately specific so callers can distinguish
/// "the channel is down" from "you gave me a bad recipient" without string
/// matching. Adapters never retry a failed send; retry policy belongs to the
/// caller.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The channel is not in the Connected state. Send-family operations
    /// return this immediately, without attempting network I/O.
    #[error("channel is not connected")]
    Disconnected,

    /// The recipient could not be parsed or addressed on this platform.
    #[error("invalid recipient `{0}`")]
    InvalidRecipient(String),

    /// The platform rejected or failed the send.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// The operation belongs to a capability extension this adapter does not
    /// implement. Callers should consult [`Capabilities`](crate::traits::Capabilities)
    /// before reaching for an extension.
    #[error("{0} is not supported by this channel")]
    NotSupported(&'static str),

    /// No adapter registered under this name.
    #[error("no channel registered under `{0}`")]
    NotRegistered(String),

    /// Pairing/device-linking failed or was invoked in the wrong state.
    #[error("pairing error: {0}")]
    Pairing(String),

    /// The lifecycle state machine rejected a transition.
    #[error("illegal connection state transition {from:?} -> {to:?}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// The reconnect sequence exhausted its configured attempt budget. The
    /// adapter is now in terminal Disconnected; recovery requires operator
    /// action.
    #[error("reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    /// Failure inside the underlying platform transport.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        ChannelError::SendFailed(err.to_string())
    }
}
