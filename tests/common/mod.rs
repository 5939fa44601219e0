//! Shared helpers for the integration suites.
#![allow(dead_code)]

use std::path::Path;

use chrono::NaiveDate;
use mergetree::engine::{MergeTreeEngine, TableDescription};
use mergetree::part_name::days_from_date;
use mergetree::{
    Block, ColumnDescription, DataType, Field, FunctionRegistry, MergeMode, MergeTreeSettings,
};

/// A `(date, user_id)` table, the shape the scenario seeds use.
pub fn date_user_description() -> TableDescription {
    TableDescription {
        columns: vec![
            ColumnDescription::new("date", DataType::Date),
            ColumnDescription::new("user_id", DataType::UInt64),
        ],
        primary_key: vec!["date".to_string(), "user_id".to_string()],
        date_column: "date".to_string(),
        merge_mode: MergeMode::Ordinary,
        sign_column: None,
    }
}

pub fn open_engine(dir: &Path, settings: MergeTreeSettings) -> MergeTreeEngine {
    let engine = MergeTreeEngine::new(
        dir,
        date_user_description(),
        settings,
        FunctionRegistry::with_builtins(),
    )
    .expect("engine construction");
    engine.load(false).expect("initial load");
    engine
}

/// Day number of a calendar date, as stored in a `Date` column.
pub fn day(y: i32, m: u32, d: u32) -> u64 {
    days_from_date(NaiveDate::from_ymd_opt(y, m, d).expect("valid date"))
}

/// Build a `(date, user_id)` block from rows.
pub fn rows_block(rows: &[(u64, u64)]) -> Block {
    let mut block = Block::new();
    block
        .add_column(
            ColumnDescription::new("date", DataType::Date),
            rows.iter().map(|(d, _)| Field::UInt64(*d)).collect(),
        )
        .expect("date column");
    block
        .add_column(
            ColumnDescription::new("user_id", DataType::UInt64),
            rows.iter().map(|(_, u)| Field::UInt64(*u)).collect(),
        )
        .expect("user_id column");
    block
}

/// Every `(date, user_id)` row currently readable from the engine.
pub fn read_all_rows(engine: &MergeTreeEngine) -> Vec<(u64, u64)> {
    use mergetree::BlockInputStream;

    let mut rows = Vec::new();
    for (part, ranges) in engine.select_reads(None).expect("plan") {
        let mut reader = engine
            .read_part(part, engine.columns(), ranges)
            .expect("reader");
        while let Some(block) = reader.read().expect("read") {
            let dates = block.column_values("date").expect("date column");
            let users = block.column_values("user_id").expect("user_id column");
            for (date, user) in dates.iter().zip(users) {
                match (date, user) {
                    (Field::UInt64(d), Field::UInt64(u)) => rows.push((*d, *u)),
                    other => panic!("unexpected lanes: {other:?}"),
                }
            }
        }
    }
    rows.sort();
    rows
}
