use crate::domain::authorization::AuthorizationStore;
use crate::domain::models::{PeripheralState, ProtocolMessage};
use crate::error::{GattError, StoreError};
use tracing::{debug, info};

/// Applies messages received from one switch peripheral to the controller's
/// view of it, consulting and updating the authorization store.
pub struct PeripheralController {
    address: String,
    store: AuthorizationStore,
    state: PeripheralState,
}

impl PeripheralController {
    pub fn new(address: impl Into<String>, store: AuthorizationStore) -> Self {
        let address = address.into();
        let authorized = store.is_authorized(&address);
        Self {
            address,
            store,
            state: PeripheralState {
                output: None,
                authorized,
                control_enabled: false,
            },
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    /// Process one message. Returns the reply to write back, if any.
    pub fn handle(&mut self, message: &ProtocolMessage) -> Result<Option<ProtocolMessage>, StoreError> {
        match message {
            ProtocolMessage::On => self.state.output = Some(true),
            ProtocolMessage::Off => self.state.output = Some(false),
            ProtocolMessage::Auth => {
                self.store.set_authorized(&self.address)?;
                self.state.authorized = true;
                self.state.control_enabled = true;
                info!("Authorized by {}", self.address);
            }
            ProtocolMessage::Ready => {
                self.state.authorized = self.store.is_authorized(&self.address);
                self.state.control_enabled = self.state.authorized;
            }
            ProtocolMessage::Query => {
                self.state.authorized = self.store.is_authorized(&self.address);
                if self.state.authorized {
                    return Ok(Some(ProtocolMessage::Auth));
                }
            }
            ProtocolMessage::Unknown(raw) => {
                debug!("Ignoring unrecognized payload {:?}", raw);
            }
        }
        Ok(None)
    }

    /// The message to write for switching the output, if control is enabled.
    pub fn output_command(&self, on: bool) -> Result<ProtocolMessage, GattError> {
        if !self.state.control_enabled {
            return Err(GattError::Unauthorized);
        }
        Ok(if on {
            ProtocolMessage::On
        } else {
            ProtocolMessage::Off
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn test_output_tracks_reports() {
        let mut controller = PeripheralController::new(ADDR, AuthorizationStore::in_memory());
        assert_eq!(controller.state().output, None);
        controller.handle(&ProtocolMessage::On).unwrap();
        assert_eq!(controller.state().output, Some(true));
        controller.handle(&ProtocolMessage::Off).unwrap();
        assert_eq!(controller.state().output, Some(false));
    }

    #[test]
    fn test_ready_without_auth_keeps_control_disabled() {
        let mut controller = PeripheralController::new(ADDR, AuthorizationStore::in_memory());
        controller.handle(&ProtocolMessage::Ready).unwrap();
        assert!(!controller.state().control_enabled);
        assert_eq!(controller.output_command(true), Err(GattError::Unauthorized));
    }

    #[test]
    fn test_auth_persists_and_enables_control() {
        let store = AuthorizationStore::in_memory();
        let mut controller = PeripheralController::new(ADDR, store.clone());
        controller.handle(&ProtocolMessage::Auth).unwrap();

        assert!(store.is_authorized(ADDR));
        assert!(controller.state().control_enabled);
        assert_eq!(controller.output_command(false), Ok(ProtocolMessage::Off));

        // A later session for the same address starts authorized
        let mut next = PeripheralController::new(ADDR, store);
        assert!(next.state().authorized);
        assert!(!next.state().control_enabled);
        next.handle(&ProtocolMessage::Ready).unwrap();
        assert!(next.state().control_enabled);
    }

    #[test]
    fn test_query_replies_only_when_authorized() {
        let store = AuthorizationStore::in_memory();
        let mut controller = PeripheralController::new(ADDR, store.clone());
        assert_eq!(controller.handle(&ProtocolMessage::Query).unwrap(), None);

        store.set_authorized(ADDR).unwrap();
        assert_eq!(
            controller.handle(&ProtocolMessage::Query).unwrap(),
            Some(ProtocolMessage::Auth)
        );
    }

    #[test]
    fn test_unknown_is_ignored() {
        let mut controller = PeripheralController::new(ADDR, AuthorizationStore::in_memory());
        let before = controller.state();
        assert_eq!(
            controller.handle(&ProtocolMessage::Unknown("X".to_string())).unwrap(),
            None
        );
        assert_eq!(controller.state(), before);
    }
}
