use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::{Result, SchedulerError};
use crate::model::JobRecord;
use crate::traits::{DueCursor, ScheduleStore};

const DEFAULT_PAGE_SIZE: usize = 100;

/// Walks the store for enabled jobs whose `next_fire <= now`.
#[derive(Clone)]
pub struct TriggerEngine<S> {
    store: S,
    page_size: usize,
}

struct Scan<S> {
    store: S,
    now: DateTime<Utc>,
    page_size: usize,
    cursor: Option<DueCursor>,
    buffered: VecDeque<JobRecord>,
    exhausted: bool,
}

impl<S: ScheduleStore> TriggerEngine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Due jobs in `(next_fire, job_id)` order.
    ///
    /// Lazy: a page is fetched only once the previous one is consumed, so a
    /// caller that stops early never reads the rest. The stream ends after the
    /// first backend error, which it yields. Calling again restarts the scan.
    pub fn due_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> impl Stream<Item = Result<JobRecord>> + Send + 'static {
        let scan = Scan {
            store: self.store.clone(),
            now,
            page_size: self.page_size,
            cursor: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };
        futures::stream::unfold(scan, |mut scan| async move {
            loop {
                if let Some(record) = scan.buffered.pop_front() {
                    return Some((Ok(record), scan));
                }
                if scan.exhausted {
                    return None;
                }
                let page = match scan
                    .store
                    .scan_due(scan.now, scan.cursor.as_ref(), scan.page_size)
                    .await
                {
                    Ok(page) => page,
                    Err(e) => {
                        scan.exhausted = true;
                        return Some((Err(SchedulerError::infra(e)), scan));
                    }
                };
                scan.exhausted = page.len() < scan.page_size;
                match page.last().and_then(|r| r.state.next_fire.map(|t| (t, &r.state.job_id))) {
                    Some((next_fire, job_id)) => {
                        scan.cursor = Some(DueCursor {
                            next_fire,
                            job_id: job_id.clone(),
                        })
                    }
                    None => scan.exhausted = true,
                }
                scan.buffered
                    .extend(page.into_iter().filter(|r| r.definition.enabled));
            }
        })
    }
}
