use spake2::{Ed25519Group, Identity, Password, Spake2};

use crate::error::PrivetError;

/// One side of the pairing key agreement. The device creates one exchanger
/// per pairing session; a client runs the mirror image.
pub trait KeyExchanger: Send {
    /// The outbound commitment message.
    fn message(&self) -> Vec<u8>;

    /// Feed the peer's commitment. Fails when the peer used a different
    /// code.
    fn process_message(&mut self, message: &[u8]) -> Result<(), PrivetError>;

    /// The agreed key. Only available after a successful
    /// [`KeyExchanger::process_message`].
    fn key(&self) -> Result<Vec<u8>, PrivetError>;
}

/// SPAKE2 exchanger in symmetric mode over the shared pairing code.
pub struct Spake2Exchanger {
    state: Option<Spake2<Ed25519Group>>,
    message: Vec<u8>,
    key: Option<Vec<u8>>,
}

impl Spake2Exchanger {
    pub fn new(code: &str) -> Spake2Exchanger {
        let (state, message) = Spake2::<Ed25519Group>::start_symmetric(
            &Password::new(code.as_bytes()),
            &Identity::new(b"hearth-pairing"),
        );
        Spake2Exchanger {
            state: Some(state),
            message,
            key: None,
        }
    }
}

impl KeyExchanger for Spake2Exchanger {
    fn message(&self) -> Vec<u8> {
        self.message.clone()
    }

    fn process_message(&mut self, message: &[u8]) -> Result<(), PrivetError> {
        let state = self.state.take().ok_or(PrivetError::CommitmentMismatch)?;
        let key = state
            .finish(message)
            .map_err(|_| PrivetError::CommitmentMismatch)?;
        self.key = Some(key);
        Ok(())
    }

    fn key(&self) -> Result<Vec<u8>, PrivetError> {
        self.key.clone().ok_or(PrivetError::CommitmentMismatch)
    }
}

/// Development-only exchanger that sends the code in the clear and uses it
/// as the session key. Only constructible when security is disabled.
pub struct InsecureExchanger {
    code: Vec<u8>,
}

impl InsecureExchanger {
    pub fn new(code: &str) -> InsecureExchanger {
        InsecureExchanger {
            code: code.as_bytes().to_vec(),
        }
    }
}

impl KeyExchanger for InsecureExchanger {
    fn message(&self) -> Vec<u8> {
        self.code.clone()
    }

    fn process_message(&mut self, _message: &[u8]) -> Result<(), PrivetError> {
        Ok(())
    }

    fn key(&self) -> Result<Vec<u8>, PrivetError> {
        Ok(self.code.clone())
    }
}
