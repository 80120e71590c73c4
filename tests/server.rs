//! Test server mode.

use std::thread::sleep;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cli_test_dir::*;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;

/// Where our test server listens. Chosen to stay out of the way of a real
/// server on the default port.
const LISTEN_ADDR: &str = "127.0.0.1:8797";

#[test]
fn server() -> Result<()> {
    let testdir = TestDir::new("reverse-geocoder", "server");
    testdir.create_file("DE.txt", include_str!("fixtures/DE.txt"));
    testdir.create_file("FR.txt", include_str!("fixtures/FR.txt"));

    let mut child = testdir
        .cmd()
        .arg("--data-dir=.")
        .arg("--countries=DE,FR")
        .arg("server")
        .arg(format!("--listen-addr={}", LISTEN_ADDR))
        .spawn()
        .context("server failed to start")?;

    // Call our helper to actually make the HTTP requests, clean up our
    // webserver (always!), and check to see if `result` was an error.
    let result = server_helper();
    if let Err(err) = child.kill() {
        eprintln!("could not stop web server: {}", err);
    }
    let responses = result?;

    for (path, status, body) in &responses {
        eprintln!("GET {} -> {}\n{}", path, status, body);
    }
    let (_, status, body) = &responses[0];
    assert_eq!(*status, StatusCode::OK);
    assert!(body.contains("\"location\":\"Berlin, DE\""));
    assert!(body.contains("\"method\":\"geonames\""));

    let (_, status, body) = &responses[1];
    assert_eq!(*status, StatusCode::OK);
    assert!(body.contains("Paris, FR"));
    assert!(body.contains("\"method\":\"hybrid\""));

    let (_, status, body) = &responses[2];
    assert_eq!(*status, StatusCode::BAD_REQUEST);
    assert!(body.contains("\"error\""));

    let (_, status, body) = &responses[3];
    assert_eq!(*status, StatusCode::OK);
    assert!(body.contains("\"status\":\"healthy\""));

    let (_, status, body) = &responses[4];
    assert_eq!(*status, StatusCode::NOT_FOUND);
    assert!(body.contains("Endpoint not found"));

    let (_, status, body) = &responses[5];
    assert_eq!(*status, StatusCode::OK);
    assert!(body.contains("reversegeocoder_lookups_total"));
    Ok(())
}

/// Helper function for `server` test, so that test can clean up the actual
/// server process. This must _not_ use `assert!` or other functions that panic,
/// or we won't clean up.
fn server_helper() -> Result<Vec<(&'static str, StatusCode, String)>> {
    let client = Client::new();
    let get = |path: &str| -> Result<Response> {
        client
            .get(format!("http://{}{}", LISTEN_ADDR, path))
            .send()
            .context("HTTP request failed")
    };

    // We may need to retry this several times depending on how long the server
    // takes to start.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match get("/health") {
            Ok(_) => break,
            Err(err) if Instant::now() < deadline => {
                eprintln!("request failed; retrying: {:?}", err);
                sleep(Duration::from_millis(100));
            }
            Err(err) => return Err(err).context("http request timed out with error"),
        }
    }

    let paths = [
        "/api/reverse-geocode?lat=52.52&lon=13.405",
        "/api/reverse-geocode?lat=48.8566&lon=2.3522&method=hybrid",
        "/api/reverse-geocode?lon=2.3522",
        "/health",
        "/api/nope",
        "/metrics",
    ];
    let mut responses = Vec::with_capacity(paths.len());
    for path in paths {
        let response = get(path)?;
        let status = response.status();
        let body = response.text().context("couldn't get response body")?;
        responses.push((path, status, body));
    }
    Ok(responses)
}
