//! Entry and attribute model.
//!
//! Mutating an [`Entry`] never applies a change silently: every add/set/
//! delete/reset is recorded in the entry's change log, and update operations
//! consume that log explicitly (see `ModifyRequest::from_changes`).

use crate::dn::Dn;
use std::fmt;

/// An attribute description plus its ordered values.
///
/// The description may carry options after a `;` (e.g.
/// `userCertificate;binary`); option order is not significant when
/// comparing descriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    name: String,
    values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(name: impl Into<String>, values: Vec<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn from_strings<S: Into<String>>(
        name: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            name: name.into(),
            values: values
                .into_iter()
                .map(|v| v.into().into_bytes())
                .collect(),
        }
    }

    /// The full description, options included.
    pub fn description(&self) -> &str {
        &self.name
    }

    /// The attribute type without options.
    pub fn base_name(&self) -> &str {
        self.name.split(';').next().unwrap_or(&self.name)
    }

    pub fn options(&self) -> impl Iterator<Item = &str> {
        self.name.split(';').skip(1)
    }

    pub fn has_options(&self) -> bool {
        self.name.contains(';')
    }

    pub fn values(&self) -> &[Vec<u8>] {
        &self.values
    }

    /// Values lossily decoded as UTF-8, for text-valued attributes.
    pub fn string_values(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect()
    }

    pub fn first_value(&self) -> Option<&[u8]> {
        self.values.first().map(|v| v.as_slice())
    }

    pub fn push(&mut self, value: impl Into<Vec<u8>>) {
        self.values.push(value.into());
    }

    /// Drop all values, keeping the description. Used when a search asks
    /// for attribute types only.
    pub fn reset(&mut self) {
        self.values.clear();
    }

    /// Case-insensitive match on the base name; options must agree as a
    /// set when both sides carry any.
    pub fn matches(&self, other: &str) -> bool {
        let (other_base, other_opts) = match other.split_once(';') {
            Some((base, opts)) => (base, Some(opts)),
            None => (other, None),
        };
        if !self.base_name().eq_ignore_ascii_case(other_base) {
            return false;
        }
        match other_opts {
            None => true,
            Some(opts) => {
                let mut theirs: Vec<String> =
                    opts.split(';').map(|o| o.to_ascii_lowercase()).collect();
                let mut ours: Vec<String> =
                    self.options().map(|o| o.to_ascii_lowercase()).collect();
                theirs.sort();
                ours.sort();
                theirs == ours
            }
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.string_values().join(", "))
    }
}

/// One recorded mutation of an entry, matching the RFC 4511 modify
/// change types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Add(Attribute),
    Delete(Attribute),
    Replace(Attribute),
}

/// The accumulated change log of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changes(Vec<Change>);

impl Changes {
    pub fn push(&mut self, change: Change) {
        self.0.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.0.iter()
    }

    pub fn reset(&mut self) {
        self.0.clear();
    }

    pub fn into_vec(self) -> Vec<Change> {
        self.0
    }
}

/// A directory entry: a DN plus attributes, with a change log alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    dn: Dn,
    attributes: Vec<Attribute>,
    changes: Changes,
}

impl Entry {
    pub fn new(dn: impl Into<Dn>, attributes: Vec<Attribute>) -> Self {
        Self {
            dn: dn.into(),
            attributes,
            changes: Changes::default(),
        }
    }

    /// Build an entry from (name, values) pairs of strings.
    pub fn from_attributes<N, V>(
        dn: impl Into<Dn>,
        attributes: impl IntoIterator<Item = (N, Vec<V>)>,
    ) -> Self
    where
        N: Into<String>,
        V: Into<String>,
    {
        Self::new(
            dn,
            attributes
                .into_iter()
                .map(|(name, values)| Attribute::from_strings(name, values))
                .collect(),
        )
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut Vec<Attribute> {
        &mut self.attributes
    }

    pub fn get(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.matches(name))
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Add values to an attribute, recording an Add change.
    pub fn add<S: Into<String>>(&mut self, name: impl Into<String>, values: impl IntoIterator<Item = S>) {
        let attribute = Attribute::from_strings(name, values);
        self.changes.push(Change::Add(attribute.clone()));
        match self.attributes.iter_mut().find(|a| a.matches(attribute.description())) {
            Some(existing) => {
                for value in attribute.values() {
                    existing.push(value.clone());
                }
            }
            None => self.attributes.push(attribute),
        }
    }

    /// Replace an attribute's values, recording a Replace change.
    pub fn set<S: Into<String>>(&mut self, name: impl Into<String>, values: impl IntoIterator<Item = S>) {
        let attribute = Attribute::from_strings(name, values);
        self.changes.push(Change::Replace(attribute.clone()));
        match self.attributes.iter_mut().find(|a| a.matches(attribute.description())) {
            Some(existing) => *existing = attribute,
            None => self.attributes.push(attribute),
        }
    }

    /// Delete specific values (or the whole attribute when no values are
    /// given), recording a Delete change.
    pub fn delete<S: Into<String>>(&mut self, name: impl Into<String>, values: impl IntoIterator<Item = S>) {
        let attribute = Attribute::from_strings(name, values);
        self.changes.push(Change::Delete(attribute.clone()));
        if attribute.values().is_empty() {
            self.attributes.retain(|a| !a.matches(attribute.description()));
        } else if let Some(existing) = self
            .attributes
            .iter_mut()
            .find(|a| a.matches(attribute.description()))
        {
            existing
                .values
                .retain(|v| !attribute.values().contains(v));
        }
    }

    /// Remove an attribute from the local representation without recording
    /// a change. Used when shaping an entry for the wire (e.g. root DSE
    /// attribute selection), never for directory updates.
    pub fn remove_local(&mut self, name: &str) {
        self.attributes.retain(|a| !a.matches(name));
    }

    pub fn changes(&self) -> &Changes {
        &self.changes
    }

    /// Hand the accumulated change log to the caller, leaving it empty.
    pub fn take_changes(&mut self) -> Changes {
        std::mem::take(&mut self.changes)
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "dn: {}", self.dn)?;
        for attribute in &self.attributes {
            writeln!(f, "{attribute}")?;
        }
        Ok(())
    }
}

/// An ordered collection of entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Entries(Vec<Entry>);

impl Entries {
    pub fn new(entries: Vec<Entry>) -> Self {
        Entries(entries)
    }

    pub fn push(&mut self, entry: Entry) {
        self.0.push(entry);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&Entry> {
        self.0.first()
    }

    pub fn get(&self, dn: &str) -> Option<&Entry> {
        self.0.iter().find(|e| e.dn().as_str().eq_ignore_ascii_case(dn))
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.0.iter()
    }

    pub fn extend(&mut self, other: Entries) {
        self.0.extend(other.0);
    }

    pub fn into_vec(self) -> Vec<Entry> {
        self.0
    }
}

impl IntoIterator for Entries {
    type Item = Entry;
    type IntoIter = std::vec::IntoIter<Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<Entry> for Entries {
    fn from_iter<T: IntoIterator<Item = Entry>>(iter: T) -> Self {
        Entries(iter.into_iter().collect())
    }
}
