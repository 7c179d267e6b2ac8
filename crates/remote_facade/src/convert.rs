// Copyright 2026 The Capsule Authors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Conversions between this system's native types and their wire (generated-protobuf) forms.
//! Kept in one place so that client and server agree on exactly one mapping in each direction.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use environment::EnvironmentDescription;
use logpipe::{Level, LogRecord, Source};
use protos::gen::capsule::remote::v1 as pb;

pub fn description_to_proto(description: &EnvironmentDescription) -> Result<pb::EnvironmentDescription, String> {
    let config_json = serde_json::to_string(&description.config)
        .map_err(|e| format!("serializing the environment description's config: {e}"))?;
    Ok(pb::EnvironmentDescription {
        kind: description.kind.clone(),
        config_json,
    })
}

pub fn description_from_proto(proto: pb::EnvironmentDescription) -> Result<EnvironmentDescription, String> {
    let config: BTreeMap<String, serde_json::Value> = serde_json::from_str(&proto.config_json)
        .map_err(|e| format!("parsing the environment description's config: {e}"))?;
    let mut description = EnvironmentDescription::new(proto.kind);
    for (key, value) in config {
        description = description.with_config(key, value);
    }
    Ok(description)
}

fn level_to_proto(level: Level) -> i32 {
    match level {
        Level::Trace => pb::log_record::Level::Trace as i32,
        Level::Info => pb::log_record::Level::Info as i32,
        Level::Warn => pb::log_record::Level::Warn as i32,
        Level::Error => pb::log_record::Level::Error as i32,
    }
}

fn level_from_proto(level: i32) -> Level {
    match pb::log_record::Level::try_from(level).unwrap_or(pb::log_record::Level::Info) {
        pb::log_record::Level::Trace => Level::Trace,
        pb::log_record::Level::Info => Level::Info,
        pb::log_record::Level::Warn => Level::Warn,
        pb::log_record::Level::Error => Level::Error,
    }
}

fn source_to_proto(source: Source) -> i32 {
    match source {
        Source::Bridge => pb::log_record::Source::Bridge as i32,
        Source::UserStdout => pb::log_record::Source::UserStdout as i32,
        Source::UserStderr => pb::log_record::Source::UserStderr as i32,
        Source::Backend => pb::log_record::Source::Backend as i32,
    }
}

fn source_from_proto(source: i32) -> Source {
    match pb::log_record::Source::try_from(source).unwrap_or(pb::log_record::Source::Backend) {
        pb::log_record::Source::Bridge => Source::Bridge,
        pb::log_record::Source::UserStdout => Source::UserStdout,
        pb::log_record::Source::UserStderr => Source::UserStderr,
        pb::log_record::Source::Backend => Source::Backend,
    }
}

pub fn log_record_to_proto(record: &LogRecord) -> pb::LogRecord {
    pb::LogRecord {
        level: level_to_proto(record.level),
        source: source_to_proto(record.source),
        message: record.message.clone(),
        timestamp_millis: record.timestamp.timestamp_millis(),
    }
}

pub fn log_record_from_proto(proto: pb::LogRecord) -> LogRecord {
    let timestamp: DateTime<Utc> = Utc
        .timestamp_millis_opt(proto.timestamp_millis)
        .single()
        .unwrap_or_else(Utc::now);
    LogRecord {
        level: level_from_proto(proto.level),
        source: source_from_proto(proto.source),
        message: proto.message,
        timestamp,
    }
}
