use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::calculator::{CalculationResult, VarsityCalculator};
use crate::drainer::DrainedResult;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub varsity_code: String,
    pub varsity_name: String,
    // Data source configuration
    pub headings_file: String,
    pub applications_files: Vec<String>,
    // Drain simulation configuration
    pub drain_percents: Vec<u8>,
    pub drain_iterations: usize,
    pub target_student_id: Option<String>,
    pub output_directory: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            varsity_code: "demo".to_string(),
            varsity_name: "Demo Varsity".to_string(),
            headings_file: "data/headings.csv".to_string(),
            applications_files: vec!["data/applications.csv".to_string()],
            drain_percents: vec![10, 25, 50, 75, 90],
            drain_iterations: 1000,
            target_student_id: None,
            output_directory: Some("output".to_string()),
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save_to_file(&self, file_path: &str) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(file_path, content)?;
        Ok(())
    }
}

/// Competition category of an application. The declaration order is the
/// matching engine's ordinal: a higher variant beats a lower one when two
/// applications compete for the same seat.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Competition {
    Regular,
    Bvi,
    TargetQuota,
    DedicatedQuota,
    SpecialQuota,
}

impl Competition {
    /// Quota categories hold their own seats and never share them with the
    /// general pool, except through the unused-seat overflow rule.
    pub fn is_quota(self) -> bool {
        matches!(
            self,
            Competition::TargetQuota | Competition::DedicatedQuota | Competition::SpecialQuota
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Competition::Regular => "regular",
            Competition::Bvi => "bvi",
            Competition::TargetQuota => "target_quota",
            Competition::DedicatedQuota => "dedicated_quota",
            Competition::SpecialQuota => "special_quota",
        }
    }
}

impl fmt::Display for Competition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Competition {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "regular" => Ok(Competition::Regular),
            "bvi" => Ok(Competition::Bvi),
            "target_quota" => Ok(Competition::TargetQuota),
            "dedicated_quota" => Ok(Competition::DedicatedQuota),
            "special_quota" => Ok(Competition::SpecialQuota),
            other => Err(anyhow::anyhow!("unknown competition type: {}", other)),
        }
    }
}

/// Per-heading seat counts. Quota capacities are mutually independent;
/// unused quota seats augment the general pool of the same heading only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacities {
    pub general: u32,
    pub target_quota: u32,
    pub dedicated_quota: u32,
    pub special_quota: u32,
}

impl Capacities {
    pub fn quota(&self, competition: Competition) -> u32 {
        match competition {
            Competition::TargetQuota => self.target_quota,
            Competition::DedicatedQuota => self.dedicated_quota,
            Competition::SpecialQuota => self.special_quota,
            // BVI and Regular compete in the general pool.
            Competition::Bvi | Competition::Regular => self.general,
        }
    }

    pub fn total(&self) -> u32 {
        self.general + self.target_quota + self.dedicated_quota + self.special_quota
    }
}

/// One raw application row as produced by a loader, before normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub heading_code: String,
    pub student_id: String,
    pub rating_place: u32,
    pub priority: u32,
    pub competition: Competition,
    pub score: i32,
    pub original_submitted: bool,
}

// --- Results payload: the contract handed to persistence/reporting. ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadingDto {
    pub code: String,
    pub name: String,
    pub general_capacity: u32,
    pub target_quota_capacity: u32,
    pub dedicated_quota_capacity: u32,
    pub special_quota_capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudentDto {
    pub id: String,
    pub original_submitted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationDto {
    pub student_id: String,
    pub heading_code: String,
    pub priority: u32,
    pub competition_type: Competition,
    pub rating_place: u32,
    pub score: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculationDto {
    pub heading_code: String,
    pub admitted: Vec<StudentDto>,
    pub passing_score: Option<i32>,
    pub last_admitted_rating_place: Option<u32>,
}

/// Full per-varsity results payload: headings, students, applications,
/// primary calculation results and drained statistics keyed by percent.
/// Plain data, no behavior beyond construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarsityPayload {
    pub varsity_code: String,
    pub varsity_name: String,
    pub headings: Vec<HeadingDto>,
    pub students: Vec<StudentDto>,
    pub applications: Vec<ApplicationDto>,
    pub calculations: Vec<CalculationDto>,
    pub drained: BTreeMap<u8, Vec<DrainedResult>>,
}

impl VarsityPayload {
    pub fn from_parts(
        vc: &VarsityCalculator,
        results: &[CalculationResult],
        drained: BTreeMap<u8, Vec<DrainedResult>>,
    ) -> Self {
        let headings = vc
            .headings()
            .iter()
            .map(|h| HeadingDto {
                code: h.code.clone(),
                name: h.pretty_name.clone(),
                general_capacity: h.capacities.general,
                target_quota_capacity: h.capacities.target_quota,
                dedicated_quota_capacity: h.capacities.dedicated_quota,
                special_quota_capacity: h.capacities.special_quota,
            })
            .collect();

        let mut students = Vec::new();
        let mut applications = Vec::new();
        for student in vc.students() {
            students.push(StudentDto {
                id: student.id.clone(),
                original_submitted: student.original_submitted,
            });
            for app in &student.applications {
                applications.push(ApplicationDto {
                    student_id: student.id.clone(),
                    heading_code: vc.headings()[app.heading].code.clone(),
                    priority: app.priority,
                    competition_type: app.competition,
                    rating_place: app.rating_place,
                    score: app.score,
                });
            }
        }

        let calculations = results
            .iter()
            .map(|result| CalculationDto {
                heading_code: result.heading_code.clone(),
                admitted: result
                    .admitted
                    .iter()
                    .map(|entry| StudentDto {
                        id: entry.student_id.clone(),
                        original_submitted: entry.original_submitted,
                    })
                    .collect(),
                passing_score: result.passing_score().ok(),
                last_admitted_rating_place: result.last_admitted_rating_place().ok(),
            })
            .collect();

        Self {
            varsity_code: vc.code().to_string(),
            varsity_name: vc.pretty_name().to_string(),
            headings,
            students,
            applications,
            calculations,
            drained,
        }
    }
}
