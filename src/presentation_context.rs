//! The set of presentation contexts proposed when an association is opened.

use crate::types::trim_uid;
use dicom::dictionary_std::uids;
use std::collections::HashSet;

/// One proposed presentation context: an abstract syntax with a single transfer syntax.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProposedContext {
    pub abstract_syntax: String,
    pub transfer_syntax: String,
}

/// Accumulates the (abstract syntax, transfer syntax) pairs to propose
/// the next time an association is opened.
///
/// Grows monotonically: pairs are never removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentationContextSet {
    /// abstract syntax -> transfer syntaxes, both in insertion order
    entries: Vec<(String, Vec<String>)>,
    relationship_negotiation: HashSet<String>,
}

impl PresentationContextSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer `transfer_syntax` for `abstract_syntax`.
    ///
    /// Returns `false` if either UID is empty. Returns `true` if the pair is offered
    /// afterwards, whether or not it already was. The first time an abstract syntax is
    /// seen, explicit and implicit VR little endian are offered for it as well so that
    /// a peer which only supports native encodings can still accept the object.
    pub fn add_data(&mut self, abstract_syntax: &str, transfer_syntax: &str) -> bool {
        let abstract_syntax = trim_uid(abstract_syntax);
        let transfer_syntax = trim_uid(transfer_syntax);
        if abstract_syntax.is_empty() || transfer_syntax.is_empty() {
            return false;
        }
        match self.position(abstract_syntax) {
            Some(i) => {
                let tss = &mut self.entries[i].1;
                if !tss.iter().any(|ts| ts == transfer_syntax) {
                    tss.push(transfer_syntax.to_string());
                }
            }
            None => {
                let mut tss = vec![transfer_syntax.to_string()];
                for native in [
                    uids::EXPLICIT_VR_LITTLE_ENDIAN,
                    uids::IMPLICIT_VR_LITTLE_ENDIAN,
                ] {
                    if native != transfer_syntax {
                        tss.push(native.to_string());
                    }
                }
                self.entries.push((abstract_syntax.to_string(), tss));
            }
        }
        true
    }

    /// Like [PresentationContextSet::add_data], also recording whether SOP class
    /// relationship negotiation should be proposed for `abstract_syntax`.
    pub fn add_data_with_relationship(
        &mut self,
        abstract_syntax: &str,
        transfer_syntax: &str,
        relationship_negotiation: bool,
    ) -> bool {
        if !self.add_data(abstract_syntax, transfer_syntax) {
            return false;
        }
        if relationship_negotiation {
            self.relationship_negotiation
                .insert(trim_uid(abstract_syntax).to_string());
        }
        true
    }

    pub fn contains(&self, abstract_syntax: &str, transfer_syntax: &str) -> bool {
        let transfer_syntax = trim_uid(transfer_syntax);
        self.transfer_syntaxes_for(abstract_syntax)
            .is_some_and(|tss| tss.iter().any(|ts| ts == transfer_syntax))
    }

    /// Transfer syntaxes offered for `abstract_syntax`, in proposal order.
    pub fn transfer_syntaxes_for(&self, abstract_syntax: &str) -> Option<&[String]> {
        self.position(trim_uid(abstract_syntax))
            .map(|i| self.entries[i].1.as_slice())
    }

    pub fn wants_relationship_negotiation(&self, abstract_syntax: &str) -> bool {
        self.relationship_negotiation
            .contains(trim_uid(abstract_syntax))
    }

    /// Abstract syntaxes flagged for SOP class relationship negotiation.
    pub fn relationship_negotiation(&self) -> impl Iterator<Item = &str> {
        self.relationship_negotiation.iter().map(String::as_str)
    }

    /// Every offered pair, one presentation context each, in proposal order.
    pub fn contexts(&self) -> impl Iterator<Item = ProposedContext> + '_ {
        self.entries.iter().flat_map(|(abstract_syntax, tss)| {
            tss.iter().map(move |ts| ProposedContext {
                abstract_syntax: abstract_syntax.clone(),
                transfer_syntax: ts.clone(),
            })
        })
    }

    /// Number of offered pairs.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|(_, tss)| tss.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn position(&self, abstract_syntax: &str) -> Option<usize> {
        self.entries.iter().position(|(a, _)| a == abstract_syntax)
    }
}
