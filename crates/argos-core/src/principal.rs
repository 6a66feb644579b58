//! The caller identity handed to the core by the authorization layer.
//!
//! The core never checks capabilities itself; it only records who acted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
  Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
  /// Open sections, register rooms, declare lecturer availability.
  ManageCatalog,
  /// Profile students and record course completions.
  ManageRecords,
  Enroll,
  Schedule,
}

impl Capability {
  pub const ALL: [Capability; 4] = [
    Capability::ManageCatalog,
    Capability::ManageRecords,
    Capability::Enroll,
    Capability::Schedule,
  ];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
  pub id:           String,
  pub capabilities: BTreeSet<Capability>,
}

impl Principal {
  pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
    Self { id: id.into(), capabilities: capabilities.into_iter().collect() }
  }

  /// The identity used by background jobs.
  pub fn system() -> Self { Self::new("system", Capability::ALL) }

  pub fn can(&self, capability: Capability) -> bool { self.capabilities.contains(&capability) }
}
