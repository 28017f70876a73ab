use std::collections::HashMap;

use chrono::Utc;
use futures::Stream;
use nimbusutils::read_log_tail;

use crate::{
    utils::{paginate, Page},
    NimbusResult,
};

use super::{Orchestrator, SandboxInfo, SandboxMetrics};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Orchestrator {
    /// Returns a snapshot of a sandbox.
    pub async fn info(&self, team: &str, id: &str) -> NimbusResult<SandboxInfo> {
        Ok(self.entry(team, id).await?.info())
    }

    /// Lists the team's sandboxes carrying every `metadata` pair, oldest first.
    ///
    /// The listing is a snapshot: it never waits on a sandbox that is busy changing state.
    pub async fn list(
        &self,
        team: &str,
        metadata: &HashMap<String, String>,
        limit: Option<usize>,
        token: Option<&str>,
    ) -> NimbusResult<Page<SandboxInfo>> {
        let mut items = self
            .sandboxes
            .read()
            .await
            .values()
            .filter(|entry| entry.team == team && entry.matches_metadata(metadata))
            .map(|entry| entry.info())
            .filter(|info| info.state.is_live())
            .collect::<Vec<_>>();
        items.sort_by(|a, b| list_key(a).cmp(&list_key(b)));

        paginate(items, limit, token, list_key)
    }

    /// Lazily walks every matching sandbox, fetching `page_size` at a time.
    pub fn stream<'a>(
        &'a self,
        team: &'a str,
        metadata: &'a HashMap<String, String>,
        page_size: usize,
    ) -> impl Stream<Item = NimbusResult<SandboxInfo>> + 'a {
        async_stream::stream! {
            let mut token: Option<String> = None;
            loop {
                let page = match self.list(team, metadata, Some(page_size), token.as_deref()).await {
                    Ok(page) => page,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                };

                for info in page.items {
                    yield Ok(info);
                }

                match page.next_token {
                    Some(next) => token = Some(next),
                    None => break,
                }
            }
        }
    }

    /// Samples a sandbox's resource usage.
    pub async fn metrics(&self, team: &str, id: &str) -> NimbusResult<SandboxMetrics> {
        let entry = self.entry(team, id).await?;
        let sample = entry.gateway("sample metrics")?.agent().metrics().await?;

        Ok(SandboxMetrics {
            timestamp: Utc::now(),
            resources: entry.resources,
            process_count: sample.process_count,
            cpu_percent: sample.cpu_percent,
            memory_bytes: sample.memory_bytes,
            disk_used_bytes: sample.disk_used_bytes,
        })
    }

    /// Returns the last `tail` lines of the sandbox log, or all of it.
    pub async fn logs(&self, team: &str, id: &str, tail: Option<usize>) -> NimbusResult<Vec<String>> {
        let entry = self.entry(team, id).await?;
        Ok(read_log_tail(&entry.log_path, tail).await?)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn list_key(info: &SandboxInfo) -> String {
    format!(
        "{}\0{}",
        info.started_at.format("%Y%m%d%H%M%S%6f"),
        info.sandbox_id
    )
}
