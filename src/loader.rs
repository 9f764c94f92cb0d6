use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io;
use tokio::sync::mpsc;
use tracing::info;

use crate::calculator::VarsityCalculator;
use crate::models::{ApplicationRecord, Capacities, Competition, Config};
use crate::normalizer;

#[derive(Debug, Clone)]
pub struct HeadingRecord {
    pub code: String,
    pub name: String,
    pub capacities: Capacities,
}

#[derive(Debug, Deserialize)]
struct HeadingRow {
    code: String,
    name: String,
    general: u32,
    target_quota: u32,
    dedicated_quota: u32,
    special_quota: u32,
}

#[derive(Debug, Deserialize)]
struct ApplicationRow {
    heading_code: String,
    student_id: String,
    rating_place: u32,
    priority: u32,
    competition: String,
    score: i32,
    original_submitted: bool,
}

pub fn read_headings_from<R: io::Read>(reader: R) -> Result<Vec<HeadingRecord>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut headings = Vec::new();
    for row in csv_reader.deserialize() {
        let row: HeadingRow = row.context("Failed to parse headings row")?;
        headings.push(HeadingRecord {
            code: row.code,
            name: row.name,
            capacities: Capacities {
                general: row.general,
                target_quota: row.target_quota,
                dedicated_quota: row.dedicated_quota,
                special_quota: row.special_quota,
            },
        });
    }
    Ok(headings)
}

pub fn read_applications_from<R: io::Read>(reader: R) -> Result<Vec<ApplicationRecord>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut records = Vec::new();
    for row in csv_reader.deserialize() {
        let row: ApplicationRow = row.context("Failed to parse applications row")?;
        let competition: Competition = row
            .competition
            .parse()
            .with_context(|| format!("in application of student {}", row.student_id))?;
        records.push(ApplicationRecord {
            heading_code: row.heading_code,
            student_id: row.student_id,
            rating_place: row.rating_place,
            priority: row.priority,
            competition,
            score: row.score,
            original_submitted: row.original_submitted,
        });
    }
    Ok(records)
}

pub fn read_headings_file(path: &str) -> Result<Vec<HeadingRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open headings file: {}", path))?;
    read_headings_from(file)
}

pub fn read_applications_file(path: &str) -> Result<Vec<ApplicationRecord>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open applications file: {}", path))?;
    read_applications_from(file)
}

/// Most quota applicants never submit their originals; only those who did
/// are considered.
fn admissible(record: &ApplicationRecord) -> bool {
    !(record.competition.is_quota() && !record.original_submitted)
}

/// Groups admissible records per heading code, ready for normalization.
fn group_admissible(
    records: impl IntoIterator<Item = ApplicationRecord>,
) -> BTreeMap<String, Vec<ApplicationRecord>> {
    let mut per_heading: BTreeMap<String, Vec<ApplicationRecord>> = BTreeMap::new();
    for record in records {
        if !admissible(&record) {
            continue;
        }
        per_heading
            .entry(record.heading_code.clone())
            .or_default()
            .push(record);
    }
    per_heading
}

/// Loads headings and applications into a fresh calculator. One task per
/// applications file parses rows and streams them to a single collector
/// that owns the calculator, so no locking is needed during the load
/// phase. Applications are normalized per heading before they reach the
/// matching engine.
pub async fn load_varsity(config: &Config) -> Result<VarsityCalculator> {
    let mut vc = VarsityCalculator::new(&config.varsity_code, &config.varsity_name);

    for heading in read_headings_file(&config.headings_file)? {
        vc.add_heading(heading.code, heading.capacities, heading.name);
    }

    let (tx, mut rx) = mpsc::channel::<ApplicationRecord>(256);
    let mut handles = Vec::with_capacity(config.applications_files.len());
    for path in config.applications_files.clone() {
        let tx = tx.clone();
        handles.push(tokio::spawn(async move {
            let records = read_applications_file(&path)?;
            info!(file = %path, records = records.len(), "loaded applications file");
            for record in records {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
            Ok::<(), anyhow::Error>(())
        }));
    }
    drop(tx);

    let mut raw_records = Vec::new();
    while let Some(record) = rx.recv().await {
        raw_records.push(record);
    }
    for handle in handles {
        handle.await??;
    }

    for (heading_code, apps) in group_admissible(raw_records) {
        let normalized = normalizer::normalize_heading_applications(apps);
        for record in normalized {
            vc.add_application(
                &record.heading_code,
                &record.student_id,
                record.rating_place,
                record.priority,
                record.competition,
                record.score,
            )
            .with_context(|| format!("loading applications for heading {}", heading_code))?;
            if record.original_submitted {
                vc.set_original_submitted(&record.student_id);
            }
        }
    }

    Ok(vc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_headings_csv() {
        let data = "\
code,name,general,target_quota,dedicated_quota,special_quota
CS-01,Computer Science,20,2,2,1
MA-02,Mathematics,15,1,1,1
";
        let headings = read_headings_from(data.as_bytes()).unwrap();
        assert_eq!(headings.len(), 2);
        assert_eq!(headings[0].code, "CS-01");
        assert_eq!(headings[0].capacities.general, 20);
        assert_eq!(headings[1].capacities.special_quota, 1);
    }

    #[test]
    fn parses_applications_csv() {
        let data = "\
heading_code,student_id,rating_place,priority,competition,score,original_submitted
CS-01,stu-1,3,1,regular,255,true
CS-01,stu-2,1,2,bvi,0,false
";
        let records = read_applications_from(data.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].competition, Competition::Regular);
        assert!(records[0].original_submitted);
        assert_eq!(records[1].competition, Competition::Bvi);
    }

    #[test]
    fn rejects_unknown_competition() {
        let data = "\
heading_code,student_id,rating_place,priority,competition,score,original_submitted
CS-01,stu-1,3,1,olympiad,255,true
";
        assert!(read_applications_from(data.as_bytes()).is_err());
    }

    #[test]
    fn quota_applications_without_original_are_dropped() {
        let make = |student: &str, competition: Competition, original: bool| ApplicationRecord {
            heading_code: "H1".to_string(),
            student_id: student.to_string(),
            rating_place: 1,
            priority: 1,
            competition,
            score: 200,
            original_submitted: original,
        };

        let grouped = group_admissible(vec![
            make("s1", Competition::TargetQuota, false),
            make("s2", Competition::TargetQuota, true),
            make("s3", Competition::Regular, false),
        ]);

        let kept: Vec<&str> = grouped["H1"]
            .iter()
            .map(|r| r.student_id.as_str())
            .collect();
        assert_eq!(kept, vec!["s2", "s3"]);
    }
}
