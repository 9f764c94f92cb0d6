use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Reverse;
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{Capacities, Competition};

#[derive(Debug, Error)]
pub enum CalcError {
    /// Precondition violation: the caller fed inconsistent input.
    #[error("application references unknown heading code: {0}")]
    UnknownHeading(String),
    #[error("drain percent {0} is outside 0..=100")]
    InvalidDrainPercent(i64),
    /// Expected, recoverable condition: the heading admitted nobody, so no
    /// cutoff statistics exist for it.
    #[error("heading {0} has no admitted students")]
    NoAdmittedStudents(String),
    /// Internal-consistency violation: the matching loop kept oscillating.
    #[error("admission matching did not reach a fixed point within {0} passes")]
    FixedPointNotReached(usize),
}

impl CalcError {
    /// Data-unavailable conditions are absorbed by callers; everything else
    /// must propagate.
    pub fn is_data_unavailable(&self) -> bool {
        matches!(self, CalcError::NoAdmittedStudents(_))
    }
}

/// A student's application to one heading. `heading` is an index into the
/// owning calculator's heading arena. Rating place may be rewritten once by
/// the normalizer before loading; it is immutable during matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Application {
    pub heading: usize,
    pub rating_place: u32,
    pub priority: u32,
    pub competition: Competition,
    pub score: i32,
}

#[derive(Debug, Clone)]
pub struct Student {
    pub id: String,
    /// Sorted ascending by priority (priority 1 = most preferred).
    pub applications: Vec<Application>,
    /// Withdrawn students are excluded from all consideration.
    pub quit: bool,
    /// Committed students are exempt from randomized withdrawal.
    pub original_submitted: bool,
}

#[derive(Debug, Clone)]
pub struct Heading {
    pub code: String,
    pub pretty_name: String,
    pub capacities: Capacities,
}

/// Owns the full set of students and headings for one institution.
/// Mutation happens during the load phase; `calculate_admissions` is a pure
/// query afterward. `Clone` produces a fully independent deep copy, which is
/// what makes parallel simulation safe without any locking.
#[derive(Debug, Clone, Default)]
pub struct VarsityCalculator {
    code: String,
    pretty_name: String,
    headings: Vec<Heading>,
    heading_index: HashMap<String, usize>,
    students: Vec<Student>,
    student_index: HashMap<String, usize>,
}

/// Final outcome for one heading: admitted entries ordered best-first by the
/// engine's category comparator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalculationResult {
    pub heading_code: String,
    pub heading_name: String,
    pub admitted: Vec<AdmittedEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmittedEntry {
    pub student_id: String,
    pub rating_place: u32,
    pub competition: Competition,
    pub score: i32,
    pub original_submitted: bool,
}

impl CalculationResult {
    /// Score of the worst admitted entry, the de facto cutoff.
    pub fn passing_score(&self) -> Result<i32, CalcError> {
        self.admitted
            .last()
            .map(|entry| entry.score)
            .ok_or_else(|| CalcError::NoAdmittedStudents(self.heading_code.clone()))
    }

    /// Rating place of the worst admitted entry.
    pub fn last_admitted_rating_place(&self) -> Result<u32, CalcError> {
        self.admitted
            .last()
            .map(|entry| entry.rating_place)
            .ok_or_else(|| CalcError::NoAdmittedStudents(self.heading_code.clone()))
    }
}

/// The student's currently-held winning application.
#[derive(Debug, Clone, Copy)]
struct Placement {
    heading: usize,
    priority: u32,
    competition: Competition,
}

/// One occupied seat during matching.
#[derive(Debug, Clone, Copy)]
struct Seat {
    student: usize,
    rating_place: u32,
    competition: Competition,
    score: i32,
}

/// Category comparator: a higher competition ordinal wins outright; within
/// the same category a lower rating place wins.
fn outscores(a: &Seat, b: &Seat) -> bool {
    a.competition > b.competition
        || (a.competition == b.competition && a.rating_place < b.rating_place)
}

/// Per-heading admitted lists, each kept sorted best-first.
#[derive(Debug, Default)]
struct HeadingState {
    target: Vec<Seat>,
    dedicated: Vec<Seat>,
    special: Vec<Seat>,
    general: Vec<Seat>,
}

impl HeadingState {
    fn list_mut(&mut self, competition: Competition) -> &mut Vec<Seat> {
        match competition {
            Competition::TargetQuota => &mut self.target,
            Competition::DedicatedQuota => &mut self.dedicated,
            Competition::SpecialQuota => &mut self.special,
            Competition::Bvi | Competition::Regular => &mut self.general,
        }
    }

    /// Base general capacity plus one seat for every unfilled quota seat of
    /// this heading.
    fn effective_general_capacity(&self, caps: &Capacities) -> usize {
        caps.general as usize
            + (caps.target_quota as usize).saturating_sub(self.target.len())
            + (caps.dedicated_quota as usize).saturating_sub(self.dedicated.len())
            + (caps.special_quota as usize).saturating_sub(self.special.len())
    }

    fn all_seats(&self) -> Vec<Seat> {
        let mut seats = Vec::with_capacity(
            self.target.len() + self.dedicated.len() + self.special.len() + self.general.len(),
        );
        seats.extend_from_slice(&self.target);
        seats.extend_from_slice(&self.dedicated);
        seats.extend_from_slice(&self.special);
        seats.extend_from_slice(&self.general);
        seats
    }
}

fn insert_sorted(list: &mut Vec<Seat>, seat: Seat) {
    let pos = list.partition_point(|existing| !outscores(&seat, existing));
    list.insert(pos, seat);
}

fn remove_student(list: &mut Vec<Seat>, student: usize) {
    if let Some(pos) = list.iter().position(|seat| seat.student == student) {
        list.remove(pos);
    }
}

/// Admit `seat` when the list is under capacity, or displace the worst
/// admitted seat when the newcomer beats it. The displaced student's
/// placement entry is cleared before anything else happens, so a later pass
/// reconsiders them from scratch.
fn try_place(
    list: &mut Vec<Seat>,
    capacity: usize,
    seat: Seat,
    placements: &mut [Option<Placement>],
) -> bool {
    if list.len() < capacity {
        insert_sorted(list, seat);
        return true;
    }
    let beats_worst = list.last().map_or(false, |worst| outscores(&seat, worst));
    if !beats_worst {
        return false;
    }
    if let Some(evicted) = list.pop() {
        placements[evicted.student] = None;
    }
    insert_sorted(list, seat);
    true
}

impl VarsityCalculator {
    pub fn new(code: impl Into<String>, pretty_name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            pretty_name: pretty_name.into(),
            ..Default::default()
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn pretty_name(&self) -> &str {
        &self.pretty_name
    }

    pub fn headings(&self) -> &[Heading] {
        &self.headings
    }

    pub fn students(&self) -> &[Student] {
        &self.students
    }

    pub fn heading(&self, code: &str) -> Option<&Heading> {
        self.heading_index.get(code).map(|&idx| &self.headings[idx])
    }

    pub fn student(&self, id: &str) -> Option<&Student> {
        self.student_index.get(id).map(|&idx| &self.students[idx])
    }

    pub fn add_heading(
        &mut self,
        code: impl Into<String>,
        capacities: Capacities,
        pretty_name: impl Into<String>,
    ) {
        let code = code.into();
        match self.heading_index.get(&code) {
            Some(&idx) => {
                self.headings[idx].capacities = capacities;
                self.headings[idx].pretty_name = pretty_name.into();
            }
            None => {
                self.heading_index.insert(code.clone(), self.headings.len());
                self.headings.push(Heading {
                    code,
                    pretty_name: pretty_name.into(),
                    capacities,
                });
            }
        }
    }

    /// Registers an application, keeping the student's list sorted by
    /// priority. Referencing an unknown heading code is a precondition
    /// violation and fails immediately.
    pub fn add_application(
        &mut self,
        heading_code: &str,
        student_id: &str,
        rating_place: u32,
        priority: u32,
        competition: Competition,
        score: i32,
    ) -> Result<(), CalcError> {
        let heading = *self
            .heading_index
            .get(heading_code)
            .ok_or_else(|| CalcError::UnknownHeading(heading_code.to_string()))?;

        let student = self.student_entry(student_id);
        let app = Application {
            heading,
            rating_place,
            priority,
            competition,
            score,
        };
        let pos = student
            .applications
            .partition_point(|existing| existing.priority <= app.priority);
        student.applications.insert(pos, app);
        Ok(())
    }

    pub fn set_quit(&mut self, student_id: &str) {
        if let Some(&idx) = self.student_index.get(student_id) {
            self.students[idx].quit = true;
        }
    }

    pub fn set_original_submitted(&mut self, student_id: &str) {
        if let Some(&idx) = self.student_index.get(student_id) {
            self.students[idx].original_submitted = true;
        }
    }

    fn student_entry(&mut self, id: &str) -> &mut Student {
        let idx = match self.student_index.get(id) {
            Some(&idx) => idx,
            None => {
                let idx = self.students.len();
                self.student_index.insert(id.to_string(), idx);
                self.students.push(Student {
                    id: id.to_string(),
                    applications: Vec::new(),
                    quit: false,
                    original_submitted: false,
                });
                idx
            }
        };
        &mut self.students[idx]
    }

    /// Randomly marks `floor(eligible * percent / 100)` students as quit,
    /// drawn uniformly from those who neither quit nor submitted their
    /// original. A percent of zero mutates nothing.
    ///
    /// `percent` must not exceed 100. `Drainer::new` rejects out-of-range
    /// percents before any simulation runs; a percent above 100 here is a
    /// caller bug and is capped at withdrawing every eligible student.
    pub fn simulate_originals_drain<R: Rng + ?Sized>(&mut self, percent: u8, rng: &mut R) {
        debug_assert!(percent <= 100);
        if percent == 0 {
            return;
        }
        let eligible: Vec<usize> = self
            .students
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.quit && !s.original_submitted)
            .map(|(idx, _)| idx)
            .collect();
        let count = eligible.len() * percent as usize / 100;
        for &idx in eligible.choose_multiple(rng, count) {
            self.students[idx].quit = true;
        }
    }

    /// Resolves admissions to a stable assignment: iterative deferred
    /// acceptance over per-category seat lists with preemptive displacement.
    ///
    /// Passes over all non-quit students repeat until one pass changes
    /// nothing. Within a pass each student walks their applications in
    /// priority order and stops at the first successful placement. Quota
    /// applications compete only inside their category; general-pool (BVI
    /// and Regular) applications compete for the base general capacity plus
    /// every currently-unfilled quota seat of the same heading.
    ///
    /// Pure with respect to the calculator state: repeated calls yield
    /// identical results. Returns one result per heading, sorted by code.
    pub fn calculate_admissions(&self) -> Result<Vec<CalculationResult>, CalcError> {
        let mut states: Vec<HeadingState> = self
            .headings
            .iter()
            .map(|_| HeadingState::default())
            .collect();
        let mut placements: Vec<Option<Placement>> = vec![None; self.students.len()];

        let total_applications: usize =
            self.students.iter().map(|s| s.applications.len()).sum();
        // The loop shrinks a finite potential every pass that changes
        // something; the bound only guards against internal bugs.
        let max_passes = 3 * total_applications + 3;
        let mut passes = 0;

        let mut made_change = true;
        while made_change {
            made_change = false;
            passes += 1;
            if passes > max_passes {
                return Err(CalcError::FixedPointNotReached(max_passes));
            }

            for (si, student) in self.students.iter().enumerate() {
                if student.quit {
                    continue;
                }

                for app in &student.applications {
                    if let Some(held) = placements[si] {
                        if held.priority < app.priority {
                            // Already holds a strictly more preferred seat.
                            break;
                        }
                        if held.priority == app.priority
                            && held.heading == app.heading
                            && held.competition == app.competition
                        {
                            continue;
                        }
                    }

                    let seat = Seat {
                        student: si,
                        rating_place: app.rating_place,
                        competition: app.competition,
                        score: app.score,
                    };

                    let caps = self.headings[app.heading].capacities;
                    let state = &mut states[app.heading];
                    let placed = if app.competition.is_quota() {
                        let capacity = caps.quota(app.competition) as usize;
                        let placed =
                            try_place(state.list_mut(app.competition), capacity, seat, &mut placements);
                        if placed {
                            // Filling a quota seat shrinks the general
                            // overflow; shed general admits that no longer
                            // fit.
                            let effective = state.effective_general_capacity(&caps);
                            while state.general.len() > effective {
                                if let Some(evicted) = state.general.pop() {
                                    placements[evicted.student] = None;
                                }
                            }
                        }
                        placed
                    } else {
                        let capacity = state.effective_general_capacity(&caps);
                        try_place(&mut state.general, capacity, seat, &mut placements)
                    };

                    if placed {
                        if let Some(prev) = placements[si].take() {
                            remove_student(states[prev.heading].list_mut(prev.competition), si);
                        }
                        placements[si] = Some(Placement {
                            heading: app.heading,
                            priority: app.priority,
                            competition: app.competition,
                        });
                        made_change = true;
                        break;
                    }
                }
            }
        }

        let mut results: Vec<CalculationResult> = self
            .headings
            .iter()
            .zip(states.iter())
            .map(|(heading, state)| {
                let mut seats = state.all_seats();
                seats.sort_by_key(|seat| (Reverse(seat.competition), seat.rating_place));
                let admitted = seats
                    .into_iter()
                    .map(|seat| {
                        let student = &self.students[seat.student];
                        AdmittedEntry {
                            student_id: student.id.clone(),
                            rating_place: seat.rating_place,
                            competition: seat.competition,
                            score: seat.score,
                            original_submitted: student.original_submitted,
                        }
                    })
                    .collect();
                CalculationResult {
                    heading_code: heading.code.clone(),
                    heading_name: heading.pretty_name.clone(),
                    admitted,
                }
            })
            .collect();

        results.sort_by(|a, b| a.heading_code.cmp(&b.heading_code));
        Ok(results)
    }
}
