//! What this server advertises, and what the client has actually turned on
//! via ENABLE. Kept separate per RFC 5161: capabilities merely *exist*,
//! ENABLE is what changes protocol behavior within a connection.

use imap_codec::imap_types::core::Atom;
use imap_codec::imap_types::command::SelectExamineModifier;
use imap_codec::imap_types::extensions::enable::CapabilityEnable;
use imap_codec::imap_types::response::{Capability, Data};

#[derive(Debug, Clone)]
pub struct ServerCapability(Vec<Capability<'static>>);

impl Default for ServerCapability {
    fn default() -> Self {
        Self(vec![
            Capability::Imap4Rev1,
            Capability::Idle,
            Capability::CondStore,
            Capability::Enable,
            Capability::Uidplus,
            Capability::Unselect,
            Capability::Auth(Atom::unvalidated("PLAIN").into()),
        ])
    }
}

impl ServerCapability {
    pub fn to_vec(&self) -> Vec<Capability<'static>> {
        self.0.clone()
    }
}

/// Per-connection state of capabilities the client has ENABLEd and whether
/// SELECT/EXAMINE were asked to bring in CONDSTORE.
#[derive(Debug, Clone)]
pub struct ClientCapability {
    pub condstore: CondstoreStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CondstoreStatus {
    NotEnabled,
    Enabled,
}

impl CondstoreStatus {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled)
    }
}

impl ClientCapability {
    pub fn new(_server: &ServerCapability) -> Self {
        Self {
            condstore: CondstoreStatus::NotEnabled,
        }
    }

    pub fn enable_condstore(&mut self) {
        self.condstore = CondstoreStatus::Enabled;
    }

    pub fn select_enable(&mut self, modifiers: &[SelectExamineModifier]) {
        for m in modifiers {
            if matches!(m, SelectExamineModifier::Condstore) {
                self.enable_condstore();
            }
        }
    }

    /// Applies an ENABLE request, returning only the capabilities actually
    /// recognized (unknown ones are silently ignored per RFC 5161).
    pub fn try_enable(&mut self, wanted: &[CapabilityEnable<'static>]) -> Vec<CapabilityEnable<'static>> {
        let mut applied = Vec::new();
        for w in wanted {
            if let CapabilityEnable::CondStore = w {
                self.enable_condstore();
                applied.push(w.clone());
            }
        }
        applied
    }
}

pub fn enabled_data(capabilities: Vec<CapabilityEnable<'static>>) -> Data<'static> {
    Data::Enabled { capabilities }
}
