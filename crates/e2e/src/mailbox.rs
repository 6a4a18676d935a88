//! Inbox view over a driver session

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::SelectorProfile;
use crate::correlator::{Baseline, EventSource, MailboxEntry};
use crate::driver::{Driver, Selector};
use crate::error::{DriverError, DriverResult};

/// Reads inbox state through the selector profile.
pub struct Inbox<'a, D: Driver + ?Sized> {
    driver: &'a D,
    selectors: &'a SelectorProfile,
}

impl<'a, D: Driver + ?Sized> Inbox<'a, D> {
    pub fn new(driver: &'a D, selectors: &'a SelectorProfile) -> Self {
        Self { driver, selectors }
    }

    /// Count before sending. A lookup miss yields [`Baseline::Absent`].
    pub async fn baseline(&self) -> DriverResult<Baseline> {
        match self.count().await {
            Ok(n) => Ok(Baseline::Observed(n)),
            Err(e) if e.is_lookup_miss() => {
                warn!("inbox not readable before sending ({}); baseline absent", e);
                Ok(Baseline::Absent)
            }
            Err(e) => Err(e),
        }
    }

    async fn is_marked_empty(&self) -> DriverResult<bool> {
        let Some(marker) = &self.selectors.empty_inbox_marker else {
            return Ok(false);
        };
        match self.driver.locate(marker).await {
            Ok(el) => {
                let text = self.driver.read_text(&el).await?;
                Ok(text.contains(&self.selectors.empty_inbox_text))
            }
            Err(DriverError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_required(&self, selector: &Selector) -> DriverResult<String> {
        let el = self.driver.locate(selector).await?;
        Ok(self.driver.read_text(&el).await?.trim().to_string())
    }
}

#[async_trait]
impl<'a, D: Driver + ?Sized> EventSource for Inbox<'a, D> {
    async fn count(&self) -> DriverResult<usize> {
        if let Some(list) = &self.selectors.inbox_list {
            // not rendered yet is a miss, not an empty inbox
            self.driver.locate(list).await?;
        }
        if self.is_marked_empty().await? {
            return Ok(0);
        }
        let rows = self.driver.locate_all(&self.selectors.inbox_rows).await?;
        debug!(count = rows.len(), "inbox rows");
        Ok(rows.len())
    }

    async fn newest(&self) -> DriverResult<Option<MailboxEntry>> {
        let rows = self.driver.locate_all(&self.selectors.inbox_rows).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let originator = self.read_required(&self.selectors.newest_originator).await?;
        let subject = self.read_required(&self.selectors.newest_subject).await?;
        let timestamp = match &self.selectors.newest_timestamp {
            Some(selector) => {
                let el = self.driver.locate(selector).await?;
                self.driver
                    .read_attribute(&el, &self.selectors.timestamp_attribute)
                    .await?
            }
            None => None,
        };

        Ok(Some(MailboxEntry {
            originator,
            subject,
            timestamp,
        }))
    }
}
