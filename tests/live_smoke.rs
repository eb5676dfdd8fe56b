use std::error::Error;

use scholar_throttle::{
    FetchOptions, OutcomeKind, PacingConfig, RateLimitStrategy, RequestHandler, VERSION,
};

#[tokio::test]
#[ignore = "Requires network access to httpbin.org"]
async fn live_httpbin_round_trip() -> Result<(), Box<dyn Error>> {
    println!("scholar-throttle {VERSION} live smoke test");
    let dir = tempfile::tempdir()?;
    let handler = RequestHandler::builder()
        .with_strategy(RateLimitStrategy::Aggressive)
        .with_pacing(PacingConfig {
            randomize_intervals: false,
            ..PacingConfig::default()
        })
        .with_session_dir(dir.path().join("sessions"))
        .with_stats_path(dir.path().join("stats.json"))
        .build()?;

    let set = handler
        .fetch(
            "https://httpbin.org/response-headers",
            "live",
            &FetchOptions::new().with_param("Set-Cookie", "sid=abc123; Path=/"),
        )
        .await?;
    println!("set cookie -> {} {:?}", set.kind(), set.status());

    let echo = handler.get("https://httpbin.org/cookies", "live").await?;
    assert_eq!(echo.kind(), OutcomeKind::Success);
    assert!(echo.text().unwrap_or_default().contains("abc123"));

    let limited = handler.get("https://httpbin.org/status/429", "live").await?;
    assert_eq!(limited.kind(), OutcomeKind::RateLimited);
    println!("delay after 429: {:.1}s", handler.limiter().current_delay());

    let snapshot = handler.cleanup().await?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    assert!(dir.path().join("sessions").join("live.json").exists());
    Ok(())
}
