#[path = "common/mod.rs"]
mod common;

use common::*;
use std::fs;
use subharvest::{
    append_records, format_day, parse_timestamp, read_flat_file, write_records, year_bounds, ConfigError, Credentials,
    FieldSelector, HarvestOptions,
};

/// Two appends to a new file write the header once; reading back reproduces every
/// field, integer timestamps stay integers, and awkward strings survive quoting.
#[test]
fn flat_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("rust.csv");

    let mut first = batch("a", "rust", 3);
    first[0].author = None;
    first[1].domain = "say \"hi\", then\nleave".to_string();
    first[2].time_updated = Some(1_700_000_123);
    first[2].stickied = true;
    first[2].score = -4;
    let second = batch("b", "rust", 2);

    append_records(&path, &first).unwrap();
    append_records(&path, &second).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.matches("id,subreddit,author").count(), 1);
    assert!(text.starts_with("id,subreddit,author,created_utc,score,num_comments,domain,stickied,time_updated\n"));

    let back = read_flat_file(&path).unwrap();
    let expected: Vec<_> = first.into_iter().chain(second).collect();
    assert_eq!(back, expected);
}

/// `write_records` replaces whatever was there.
#[test]
fn write_records_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("year.csv");
    write_records(&path, &batch("a", "rust", 5)).unwrap();
    write_records(&path, &batch("b", "rust", 2)).unwrap();

    let back = read_flat_file(&path).unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!(back[0].id, "b0");
}

/// Columns are matched by name, so a reordered subset still loads.
#[test]
fn flat_file_with_column_subset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("subset.csv");
    fs::write(&path, "created_utc,subreddit,id,score\n100,rust,x1,7\n\n101,rust,x2,\n").unwrap();

    let back = read_flat_file(&path).unwrap();
    assert_eq!(back.len(), 2);
    assert_eq!((back[0].id.as_str(), back[0].created_utc, back[0].score), ("x1", 100, 7));
    assert_eq!(back[1].score, 0);
    assert_eq!(back[1].author, None);

    fs::write(&path, "subreddit,score\nrust,1\n").unwrap();
    assert!(read_flat_file(&path).is_err());
}

#[test]
fn field_selector_validation() {
    let sel = FieldSelector::new(["score", "domain"]).unwrap();
    assert_eq!(sel.fields(), ["id", "subreddit", "created_utc", "score", "domain"]);
    assert_eq!(sel.to_query_value(), "id,subreddit,created_utc,score,domain");

    // `time_updated` exists only locally and is never requested.
    let sel = FieldSelector::new(["time_updated"]).unwrap();
    assert_eq!(sel.fields().len(), 3);

    match FieldSelector::new(["score", "upvote_ratio"]) {
        Err(ConfigError::UnknownField(f)) => assert_eq!(f, "upvote_ratio"),
        other => panic!("expected unknown field, got {other:?}"),
    }
    assert!(HarvestOptions::default().with_fields(["title"]).is_err());
}

#[test]
fn options_validation() {
    assert!(HarvestOptions::default().validate().is_ok());
    assert!(matches!(HarvestOptions::default().with_page_size(0).validate(), Err(ConfigError::Zero("page_size"))));
    assert_eq!(HarvestOptions::default().with_lookup_batch(1000).lookup_batch, 100);
    assert_eq!(HarvestOptions::default().with_memory_budget_mb(1.5).memory_budget_bytes, 1_572_864);
}

/// Missing, malformed and incomplete credential files all fail fast.
#[test]
fn credentials_loading() {
    let dir = tempfile::tempdir().unwrap();

    let missing = dir.path().join("nope.json");
    assert!(matches!(Credentials::load(&missing), Err(ConfigError::Credentials { .. })));

    let malformed = dir.path().join("bad.json");
    fs::write(&malformed, "{ client_id: ").unwrap();
    assert!(matches!(Credentials::load(&malformed), Err(ConfigError::Credentials { .. })));

    let incomplete = dir.path().join("incomplete.json");
    fs::write(
        &incomplete,
        r#"{"client_id":"id","client_secret":"","username":"u","password":"p","user_agent":"ua"}"#,
    )
    .unwrap();
    let err = Credentials::load(&incomplete).unwrap_err();
    assert!(err.to_string().contains("client_secret"));

    let good = dir.path().join("auth.json");
    fs::write(
        &good,
        r#"{"client_id":"id","client_secret":"s3cret","username":"u","password":"hunter2","user_agent":"ua"}"#,
    )
    .unwrap();
    let creds = Credentials::load(&good).unwrap();
    assert_eq!(creds.username, "u");
    // Secrets never reach the logs.
    let shown = format!("{creds:?}");
    assert!(!shown.contains("s3cret") && !shown.contains("hunter2"));
}

#[test]
fn date_parsing() {
    assert_eq!(parse_timestamp("2020-01-01").unwrap(), 1_577_836_800);
    assert_eq!(parse_timestamp("1577836800").unwrap(), 1_577_836_800);
    assert_eq!(parse_timestamp("2020-01-01T01:00:00+01:00").unwrap(), 1_577_836_800);
    assert!(matches!(parse_timestamp("01/02/2020"), Err(ConfigError::InvalidDate { .. })));
    assert!(parse_timestamp("").is_err());

    assert_eq!(year_bounds(2020).unwrap(), (1_577_836_800, 1_609_459_200));
    assert_eq!(format_day(1_577_836_800), "20-01-01");
}
