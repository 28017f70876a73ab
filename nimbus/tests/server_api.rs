use std::net::SocketAddr;

use chrono::TimeDelta;
use nimbus::{
    config::NimbusConfig,
    server::{issue_api_key, serve_with_listener, TEAM_HEADER},
    Nimbus,
};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

struct TestServer {
    base: String,
    nimbus: Nimbus,
    shutdown: CancellationToken,
    task: JoinHandle<nimbus::NimbusResult<()>>,
    client: reqwest::Client,
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_sandbox_lifecycle_over_rest() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let server = TestServer::start(NimbusConfig::builder().home_dir(tmp.path()).build()).await?;

    let health = server.client.get(server.url("/health")).send().await?;
    assert_eq!(health.status(), StatusCode::OK);

    let volume = server
        .post("/volumes", "team-a", json!({ "name": "proj" }))
        .await?;
    assert_eq!(volume.status(), StatusCode::CREATED);

    let created = server
        .post(
            "/sandboxes",
            "team-a",
            json!({
                "volume": { "volume": "proj", "mount_path": "/workspace" },
                "metadata": { "purpose": "e2e" },
                "timeout": 120,
            }),
        )
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);
    let created: Value = created.json().await?;
    let id = created["sandbox_id"].as_str().unwrap_or_default().to_string();
    assert_eq!(created["state"], "running");
    assert!(created["traffic_token"].is_string());

    // Commands
    let run: Value = server
        .post(
            &format!("/sandboxes/{id}/commands"),
            "team-a",
            json!({ "cmd": "echo hi" }),
        )
        .await?
        .json()
        .await?;
    assert_eq!(run["exit_code"], 0);
    assert_eq!(run["stdout"], "hi\n");

    let failed: Value = server
        .post(
            &format!("/sandboxes/{id}/commands"),
            "team-a",
            json!({ "cmd": "echo oops >&2; exit 3" }),
        )
        .await?
        .json()
        .await?;
    assert_eq!(failed["exit_code"], 3);
    assert_eq!(failed["stderr"], "oops\n");

    let background: Value = server
        .post(
            &format!("/sandboxes/{id}/commands"),
            "team-a",
            json!({ "cmd": "sleep 0.2; echo done", "background": true }),
        )
        .await?
        .json()
        .await?;
    let pid = background["pid"].as_u64().unwrap_or_default();
    let waited: Value = server
        .post(
            &format!("/sandboxes/{id}/commands/{pid}/wait"),
            "team-a",
            json!({}),
        )
        .await?
        .json()
        .await?;
    assert_eq!(waited["stdout"], "done\n");

    // Files
    let written = server
        .client
        .put(server.url(&format!("/sandboxes/{id}/files?path=/workspace/a.txt")))
        .header(TEAM_HEADER, "team-a")
        .body("abc")
        .send()
        .await?;
    assert_eq!(written.status(), StatusCode::OK);

    let read = server
        .get(&format!("/sandboxes/{id}/files?path=/workspace/a.txt"), "team-a")
        .await?;
    assert_eq!(read.status(), StatusCode::OK);
    assert_eq!(read.text().await?, "abc");

    let exists: Value = server
        .get(&format!("/sandboxes/{id}/files/exists?path=/workspace/nope"), "team-a")
        .await?
        .json()
        .await?;
    assert_eq!(exists["exists"], false);

    let missing = server
        .get(&format!("/sandboxes/{id}/files?path=/workspace/nope"), "team-a")
        .await?;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    // Listing and team scoping
    let listed: Value = server
        .get("/sandboxes?metadata=purpose:e2e", "team-a")
        .await?
        .json()
        .await?;
    assert_eq!(listed["items"].as_array().map(Vec::len), Some(1));

    let foreign = server.get(&format!("/sandboxes/{id}"), "team-b").await?;
    assert_eq!(foreign.status(), StatusCode::NOT_FOUND);
    let body: Value = foreign.json().await?;
    assert_eq!(body["error_type"], "not_found");
    assert_eq!(body["code"], 404);

    // Kill is idempotent
    let killed: Value = server
        .delete(&format!("/sandboxes/{id}"), "team-a")
        .await?
        .json()
        .await?;
    assert_eq!(killed["killed"], true);
    let killed: Value = server
        .delete(&format!("/sandboxes/{id}"), "team-a")
        .await?
        .json()
        .await?;
    assert_eq!(killed["killed"], false);

    let gone = server.get(&format!("/sandboxes/{id}"), "team-a").await?;
    assert_eq!(gone.status(), StatusCode::NOT_FOUND);

    // The volume kept the file
    let file = server
        .get("/volumes/proj/file?path=a.txt", "team-a")
        .await?;
    assert_eq!(file.bytes().await?.as_ref(), b"abc");

    server.stop().await
}

#[test_log::test(tokio::test)]
async fn test_validation_errors_use_the_error_shape() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let server = TestServer::start(NimbusConfig::builder().home_dir(tmp.path()).build()).await?;

    server
        .post("/volumes", "team-a", json!({ "name": "proj" }))
        .await?;
    let response = server
        .post(
            "/sandboxes",
            "team-a",
            json!({ "volume": { "volume": "proj", "mount_path": "/etc/proj" } }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await?;
    assert_eq!(body["error_type"], "validation");

    let usage = server
        .nimbus
        .orchestrator()
        .ledger()
        .usage("team-a")
        .await;
    assert_eq!(usage.sandboxes, 0);

    let response = server
        .post("/volumes", "team-a", json!({ "name": "Not_Valid" }))
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    server.stop().await
}

#[test_log::test(tokio::test)]
async fn test_secure_mode_requires_a_bearer_token() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = NimbusConfig::builder()
        .home_dir(tmp.path())
        .server_key("test-secret")
        .build();
    let server = TestServer::start(config).await?;

    let anonymous = server.client.get(server.url("/sandboxes")).send().await?;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
    let body: Value = anonymous.json().await?;
    assert_eq!(body["error_type"], "authentication");

    let forged = issue_api_key("other-secret", "team-a", TimeDelta::hours(1))?;
    let response = server
        .client
        .get(server.url("/sandboxes"))
        .bearer_auth(&forged)
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let token = issue_api_key("test-secret", "team-a", TimeDelta::hours(1))?;
    let created = server
        .client
        .post(server.url("/volumes"))
        .bearer_auth(&token)
        .json(&json!({ "name": "data" }))
        .send()
        .await?;
    assert_eq!(created.status(), StatusCode::CREATED);

    // The team comes from the token, not from the header.
    let volumes = server.nimbus.volumes().list("team-a", None, None).await?;
    assert_eq!(volumes.items.len(), 1);

    // Health stays open.
    let health = server.client.get(server.url("/health")).send().await?;
    assert_eq!(health.status(), StatusCode::OK);

    server.stop().await
}

#[test_log::test(tokio::test)]
async fn test_rate_limit_answers_429() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let config = NimbusConfig::builder()
        .home_dir(tmp.path())
        .rate_limit_per_sec(3)
        .build();
    let server = TestServer::start(config).await?;

    let mut limited = None;
    for _ in 0..20 {
        let response = server.get("/volumes", "team-a").await?;
        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            limited = Some(response);
            break;
        }
    }

    let response = limited.ok_or_else(|| anyhow::anyhow!("never rate limited"))?;
    assert!(response.headers().contains_key("retry-after"));
    let body: Value = response.json().await?;
    assert_eq!(body["error_type"], "rate_limit");

    // Another team is unaffected.
    let other = server.get("/volumes", "team-b").await?;
    assert_eq!(other.status(), StatusCode::OK);

    server.stop().await
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl TestServer {
    async fn start(config: NimbusConfig) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).await?;
        let addr = listener.local_addr()?;

        let nimbus = Nimbus::new(config).await?;
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve_with_listener(
            nimbus.clone(),
            listener,
            shutdown.clone(),
        ));

        Ok(Self {
            base: format!("http://{addr}"),
            nimbus,
            shutdown,
            task,
            client: reqwest::Client::new(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }

    async fn get(&self, path: &str, team: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .get(self.url(path))
            .header(TEAM_HEADER, team)
            .send()
            .await
    }

    async fn post(&self, path: &str, team: &str, body: Value) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.url(path))
            .header(TEAM_HEADER, team)
            .json(&body)
            .send()
            .await
    }

    async fn delete(&self, path: &str, team: &str) -> reqwest::Result<reqwest::Response> {
        self.client
            .delete(self.url(path))
            .header(TEAM_HEADER, team)
            .send()
            .await
    }

    async fn stop(self) -> anyhow::Result<()> {
        // Idle keep-alive connections would hold up the graceful shutdown.
        drop(self.client);
        self.shutdown.cancel();
        self.task.await??;
        self.nimbus.shutdown().await;
        Ok(())
    }
}
