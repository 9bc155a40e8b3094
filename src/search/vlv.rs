//! Virtual list view cursor: a windowed offset over a server-side sorted
//! result list.

use crate::client::LdapClient;
use crate::controls::{
    Control, ControlValue, Controls, SortKey, VlvResponseValue, OID_VLV_RESPONSE,
};
use crate::entry::Entries;
use crate::error::LdapError;
use crate::message::SearchRequest;

/// Moves a before/after window across the list by offset or by percentage.
/// Offsets are 1-based and clamp at 1 and the server's content count.
pub struct Vlv<'a> {
    client: &'a mut LdapClient,
    search: SearchRequest,
    sort: Vec<SortKey>,
    before: u32,
    after: u32,
    /// Target offset, or a percentage in percentage mode.
    offset: u32,
    as_percentage: bool,
    response: Option<VlvResponseValue>,
}

impl<'a> Vlv<'a> {
    pub fn new(
        client: &'a mut LdapClient,
        search: SearchRequest,
        sort_attribute: impl Into<String>,
    ) -> Self {
        Self {
            client,
            search,
            sort: vec![SortKey::new(sort_attribute)],
            before: 0,
            after: 100,
            offset: 1,
            as_percentage: false,
            response: None,
        }
    }

    /// Entries to include before the target position.
    pub fn before_position(mut self, before: u32) -> Self {
        self.before = before;
        self
    }

    /// Entries to include after the target position.
    pub fn after_position(mut self, after: u32) -> Self {
        self.after = after;
        self
    }

    /// Treat targets as percentages of the list instead of offsets.
    pub fn as_percentage(mut self, as_percentage: bool) -> Self {
        self.as_percentage = as_percentage;
        self
    }

    pub fn move_to(&mut self, offset: u32) -> &mut Self {
        self.offset = self.clamp(offset);
        self
    }

    pub fn move_forward(&mut self, n: u32) -> &mut Self {
        self.offset = self.clamp(self.offset.saturating_add(n));
        self
    }

    pub fn move_backward(&mut self, n: u32) -> &mut Self {
        self.offset = self.clamp(self.offset.saturating_sub(n));
        self
    }

    /// The server's estimate of the full list size.
    pub fn list_size(&self) -> Option<u32> {
        self.response.as_ref().map(|r| r.content_count)
    }

    /// The server-confirmed offset of the current window.
    pub fn list_offset(&self) -> Option<u32> {
        self.response.as_ref().map(|r| r.target_position)
    }

    /// The current position as a percentage of the list.
    pub fn position(&self) -> Option<u32> {
        if self.as_percentage {
            return Some(self.offset);
        }
        let response = self.response.as_ref()?;
        if response.content_count == 0 {
            return None;
        }
        Some(scale(response.target_position, 100, response.content_count))
    }

    pub fn is_at_start_of_list(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|r| r.target_position.saturating_sub(self.before) <= 1)
    }

    pub fn is_at_end_of_list(&self) -> bool {
        self.response
            .as_ref()
            .is_some_and(|r| r.target_position.saturating_add(self.after) >= r.content_count)
    }

    /// Fetch the window at the current target.
    pub async fn get_entries(&mut self) -> Result<Entries, LdapError> {
        let content_count = self
            .response
            .as_ref()
            .map(|r| r.content_count)
            .unwrap_or(0);
        let offset = if self.as_percentage && content_count != 0 {
            scale(self.offset, content_count, 100).max(1)
        } else {
            self.offset
        };
        let controls = Controls::from_vec(vec![
            Control::sort(self.sort.clone()),
            Control::vlv(self.before, self.after, offset, content_count),
        ]);
        let outcome = self
            .client
            .search_with_controls(self.search.clone(), controls)
            .await?;
        if !outcome.result.is_success() {
            return Err(LdapError::Operation {
                code: outcome.result.code,
                message: outcome.result.diagnostics,
                referrals: outcome.result.referrals,
            });
        }
        let response = match outcome.controls.get(OID_VLV_RESPONSE) {
            Some(control) => match &control.value {
                ControlValue::VlvResponse(value) => value.clone(),
                _ => {
                    return Err(LdapError::Protocol(
                        "expected a VLV response control".into(),
                    ))
                }
            },
            None => {
                return Err(LdapError::Protocol(
                    "the server returned no VLV response control".into(),
                ))
            }
        };
        self.response = Some(response);
        Ok(outcome.entries)
    }

    fn clamp(&self, offset: u32) -> u32 {
        let upper = if self.as_percentage {
            100
        } else {
            match self.response.as_ref() {
                Some(r) if r.content_count > 0 => r.content_count,
                _ => u32::MAX,
            }
        };
        offset.clamp(1, upper)
    }
}

/// `value * numerator / denominator`, rounded half-up, without overflow.
fn scale(value: u32, numerator: u32, denominator: u32) -> u32 {
    ((value as u64 * numerator as u64 + denominator as u64 / 2) / denominator as u64) as u32
}
