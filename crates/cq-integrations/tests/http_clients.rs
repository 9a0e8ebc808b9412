//! HTTP collaborators against a scripted local server.

use std::time::Duration;

use chrono::Utc;
use cq_core::{ChangeInfo, ReviewClient, ReviewError, StatusPayload, StatusSink, TryJobState};
use cq_integrations::{HttpReviewClient, HttpStatusSink, RetryPolicy, ReviewClientConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One recorded request: request line plus body.
#[derive(Debug)]
struct Recorded {
    line: String,
    body: String,
}

async fn read_request(stream: &mut TcpStream) -> Recorded {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed before sending headers");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|l| l.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .map(|(_, v)| v.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "client closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }
    Recorded {
        line: head.lines().next().unwrap_or_default().to_string(),
        body: String::from_utf8_lossy(&buf[header_end..header_end + content_length]).to_string(),
    }
}

/// Serve the scripted responses in order, one connection each.
async fn serve(responses: Vec<(u16, &'static str)>) -> (String, JoinHandle<Vec<Recorded>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let mut seen = Vec::new();
        for (status, body) in responses {
            let (mut stream, _) = listener.accept().await.unwrap();
            seen.push(read_request(&mut stream).await);
            let response = format!(
                "HTTP/1.1 {status} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
        }
        seen
    });
    (url, handle)
}

fn client(url: &str) -> HttpReviewClient {
    let mut config = ReviewClientConfig::new(url);
    config.user = Some("commit-bot@example.org".to_string());
    config.retry = RetryPolicy {
        max_retries: 2,
        backoff_base_ms: 1,
    };
    HttpReviewClient::new(config).unwrap()
}

#[tokio::test]
async fn list_pending_queries_commit_flagged_issues() {
    let (url, server) = serve(vec![(
        200,
        r#"{"results": [{
            "issue": 12,
            "owner_email": "dev@example.org",
            "description": "Add widget",
            "base_url": "https://git.example.org/project.git",
            "patchsets": [1, 2],
            "created": "2024-05-02 08:00:00.5",
            "messages": []
        }]}"#,
    )])
    .await;

    let changes = client(&url).list_pending().await.unwrap();
    let requests = server.await.unwrap();

    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].issue, 12);
    assert_eq!(changes[0].patchset, 2);
    assert!(requests[0].line.starts_with("GET /search?"));
    assert!(requests[0].line.contains("commit=1"));
    assert!(requests[0].line.contains("format=json"));
}

#[tokio::test]
async fn fetch_patch_retries_server_errors() {
    let (url, server) = serve(vec![
        (503, "busy"),
        (200, "diff --git a/a b/a\n"),
    ])
    .await;

    let patch = client(&url).fetch_patch(12, 2).await.unwrap();
    let requests = server.await.unwrap();

    assert_eq!(patch, "diff --git a/a b/a\n");
    assert_eq!(requests.len(), 2);
    assert!(requests[1].line.starts_with("GET /download/issue12_2.diff"));
}

#[tokio::test]
async fn missing_issue_is_not_retried() {
    let (url, server) = serve(vec![(404, "no such issue")]).await;

    let err = client(&url).fetch_patch(99, 1).await.unwrap_err();
    let requests = server.await.unwrap();

    assert!(matches!(err, ReviewError::NotFound(99)));
    assert_eq!(requests.len(), 1);
}

#[tokio::test]
async fn comments_are_published_as_forms() {
    let (url, server) = serve(vec![(200, "OK")]).await;

    client(&url)
        .post_comment(12, "Committed: r1")
        .await
        .unwrap();
    let requests = server.await.unwrap();

    assert!(requests[0].line.starts_with("POST /12/publish"));
    assert!(requests[0].body.contains("message=Committed%3A+r1"));
    assert!(requests[0].body.contains("message_only=True"));
}

#[tokio::test]
async fn try_jobs_are_triggered_and_polled() {
    let (url, server) = serve(vec![
        (200, "{}"),
        (
            200,
            r#"{"try_job_results": [
                {"builder": "linux", "result": 0, "url": "https://ci.example.org/1"},
                {"builder": "mac", "result": -1}
            ]}"#,
        ),
    ])
    .await;
    let client = client(&url);

    client
        .trigger_try_jobs(12, 2, &["linux".to_string(), "mac".to_string()])
        .await
        .unwrap();
    let jobs = client.get_try_jobs(12, 2).await.unwrap();
    let requests = server.await.unwrap();

    assert!(requests[0].line.starts_with("POST /api/12/2/try"));
    assert!(requests[0].body.contains(r#""builders":["linux","mac"]"#));
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].state, TryJobState::Success);
    assert_eq!(jobs[1].state, TryJobState::Pending);
}

#[tokio::test]
async fn status_updates_are_posted_in_the_background() {
    let (url, server) = serve(vec![(200, "{}")]).await;
    let sink = HttpStatusSink::new(&format!("{url}/status"), Duration::from_secs(5)).unwrap();
    let change = ChangeInfo {
        issue: 77,
        patchset: 3,
        owner: "dev@example.org".to_string(),
        reviewers: Vec::new(),
        description: "Tidy".to_string(),
        base_url: "https://git.example.org/project.git".to_string(),
        relpath: String::new(),
        messages: Vec::new(),
        created_at: Utc::now(),
    };

    sink.send(
        &change,
        StatusPayload::new("commit-queue", serde_json::json!({ "state": "committed" })),
    );
    let requests = tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();

    assert!(requests[0].line.starts_with("POST /status"));
    assert!(requests[0].body.contains(r#""issue":77"#));
    assert!(requests[0].body.contains(r#""state":"committed""#));
}
