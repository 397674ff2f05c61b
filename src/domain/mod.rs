//! The coordination state shared by every connected peer.
//!
//! The mutation pipeline only ever sees these types through the
//! [`Mutable`] seam; everything here is plain data plus adapters.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::state::{Mutable, Readonly, StateError, mutable_struct};

/// Root of the shared state tree. Field names on the wire are the mutation
/// path segments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamState {
    /// Whether the operations base currently has internet reachability.
    #[serde(rename = "networkStatus")]
    pub network_status: bool,

    /// Free-form operator scratch note.
    pub note: String,

    pub incidents: HashMap<String, Incident>,

    /// Server software version, published for clients.
    pub version: Readonly<String>,
}

impl TeamState {
    pub fn new() -> Self {
        Self {
            version: Readonly::new(env!("CARGO_PKG_VERSION").to_string()),
            ..Self::default()
        }
    }
}

mutable_struct!(TeamState {
    "networkStatus" => network_status,
    "note" => note,
    "incidents" => incidents,
    "version" => version,
});

/// One search-and-rescue incident.
///
/// The display name is computed from the date, location, and training flag
/// and cannot be set; it appears in the incident's JSON encoding but has
/// no writable storage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Incident {
    pub date: String,
    pub location: String,
    pub training: bool,
    pub case_number: String,
    pub description: String,
}

impl Incident {
    pub fn name(&self) -> String {
        if self.training {
            format!("Training {} {}", self.date, self.location)
        } else {
            format!("{} {}", self.date, self.location)
        }
    }
}

/// Client-facing incident encoding: every stored field plus the computed
/// name. Decoding treats every field as an optional patch.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct ApiIncident {
    name: Option<String>,
    date: Option<String>,
    location: Option<String>,
    training: Option<bool>,
    case_number: Option<String>,
    description: Option<String>,
}

impl Mutable for Incident {
    fn value_to_json(&self) -> Result<Vec<u8>, StateError> {
        let api = ApiIncident {
            name: Some(self.name()),
            date: Some(self.date.clone()),
            location: Some(self.location.clone()),
            training: Some(self.training),
            case_number: Some(self.case_number.clone()),
            description: Some(self.description.clone()),
        };
        Ok(serde_json::to_vec(&api)?)
    }

    /// Partial update: absent fields keep their value, and the computed
    /// name cannot be written.
    fn value_from_json(&mut self, bytes: &[u8]) -> Result<(), StateError> {
        let patch: ApiIncident = serde_json::from_slice(bytes)?;
        if patch.name.is_some() {
            return Err(StateError::ReadOnly);
        }

        let mut next = self.clone();
        if let Some(date) = patch.date {
            next.date = date;
        }
        if let Some(location) = patch.location {
            next.location = location;
        }
        if let Some(training) = patch.training {
            next.training = training;
        }
        if let Some(case_number) = patch.case_number {
            next.case_number = case_number;
        }
        if let Some(description) = patch.description {
            next.description = description;
        }

        if *self == next {
            return Err(StateError::NoChange);
        }
        *self = next;
        Ok(())
    }

    fn field_mut(&mut self, name: &str) -> Result<&mut dyn Mutable, StateError> {
        match name {
            "date" => Ok(&mut self.date),
            "location" => Ok(&mut self.location),
            "training" => Ok(&mut self.training),
            "caseNumber" => Ok(&mut self.case_number),
            "description" => Ok(&mut self.description),
            "name" => Err(StateError::ReadOnly),
            _ => Err(StateError::UnknownField(name.to_string())),
        }
    }
}
