//! Clients for the two remote services.
//!
//! The rest of the crate only talks to [`PageService`] and [`LogService`];
//! [`PageClient`] and [`LogClient`] are the network implementations.

use crate::types::{Lsn, PageBuf, PageId, Result, TimelineId, WalRecord};

pub mod log;
pub mod page;
pub mod wire;

pub use self::log::LogClient;
pub use self::page::PageClient;
pub use crate::types::ServiceKind;

/// Request/response contract of the page-serving service.
pub trait PageService: Send + 'static {
    /// Fetches one full page. Never returns a partially filled buffer.
    fn read_page(&mut self, page_id: PageId) -> Result<PageBuf>;
    /// Creates the timeline on the service.
    fn create_timeline(&mut self, timeline: TimelineId) -> Result<()>;
    /// Deletes the timeline on the service.
    fn delete_timeline(&mut self, timeline: TimelineId) -> Result<()>;
    /// Latest durable position the service reports for the timeline.
    fn timeline_info(&mut self, timeline: TimelineId) -> Result<Lsn>;
    /// Side-effect free liveness probe.
    fn check_availability(&mut self) -> Result<()>;
}

/// Streaming contract of the WAL durability service.
pub trait LogService: Send + 'static {
    /// Sends one record and blocks for the committed position.
    fn append(&mut self, timeline: TimelineId, record: &WalRecord) -> Result<Lsn>;
    /// Creates the timeline on the service.
    fn create_timeline(&mut self, timeline: TimelineId) -> Result<()>;
    /// Deletes the timeline on the service.
    fn delete_timeline(&mut self, timeline: TimelineId) -> Result<()>;
    /// Latest committed position for the timeline.
    fn timeline_status(&mut self, timeline: TimelineId) -> Result<Lsn>;
    /// Liveness probe; may reconnect a dropped stream.
    fn check_availability(&mut self) -> Result<()>;
}

impl<T: PageService + ?Sized> PageService for Box<T> {
    fn read_page(&mut self, page_id: PageId) -> Result<PageBuf> {
        (**self).read_page(page_id)
    }

    fn create_timeline(&mut self, timeline: TimelineId) -> Result<()> {
        (**self).create_timeline(timeline)
    }

    fn delete_timeline(&mut self, timeline: TimelineId) -> Result<()> {
        (**self).delete_timeline(timeline)
    }

    fn timeline_info(&mut self, timeline: TimelineId) -> Result<Lsn> {
        (**self).timeline_info(timeline)
    }

    fn check_availability(&mut self) -> Result<()> {
        (**self).check_availability()
    }
}

impl<T: LogService + ?Sized> LogService for Box<T> {
    fn append(&mut self, timeline: TimelineId, record: &WalRecord) -> Result<Lsn> {
        (**self).append(timeline, record)
    }

    fn create_timeline(&mut self, timeline: TimelineId) -> Result<()> {
        (**self).create_timeline(timeline)
    }

    fn delete_timeline(&mut self, timeline: TimelineId) -> Result<()> {
        (**self).delete_timeline(timeline)
    }

    fn timeline_status(&mut self, timeline: TimelineId) -> Result<Lsn> {
        (**self).timeline_status(timeline)
    }

    fn check_availability(&mut self) -> Result<()> {
        (**self).check_availability()
    }
}
