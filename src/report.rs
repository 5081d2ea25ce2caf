//! Report rendering and the log line format.
//!
//! Library code logs through the `log` facade. The binary installs
//! `env_logger` with [`log_line`] as its format, so every line carries the
//! name of the thread that wrote it, which is the whole point when several
//! workers are printing at once.

use std::thread;

use colored::Colorize;
use log::Level;

use crate::counter::Discipline;
use crate::deadlock::{ProbeReport, RoutineState, ScenarioReport};
use crate::driver::LoadReport;
use crate::lifecycle::{Priority, TickOutcome, WorkerStatus};

/// `[LEVEL] thread-name message`, formatted on the logging thread.
pub fn log_line(level: Level, message: &str) -> String {
    let current = thread::current();
    let thread_name = current.name().unwrap_or("unnamed");
    let tag = match level {
        Level::Error => "[ERROR]".red().bold(),
        Level::Warn => "[WARN]".yellow().bold(),
        Level::Info => "[INFO]".blue(),
        Level::Debug | Level::Trace => format!("[{level}]").dimmed(),
    };
    format!("{} {} {}", tag, thread_name.dimmed(), message)
}

//==============================================================================
// Rendering
//==============================================================================

pub fn section(title: &str) {
    println!("\n{}", format!("=== {title} ===").bold());
}

fn discipline_label(discipline: Discipline) -> &'static str {
    match discipline {
        Discipline::None => "Unsynchronized",
        Discipline::Mutex => "Mutex",
        Discipline::Atomic => "Atomic",
    }
}

pub fn render_load(report: &LoadReport) -> String {
    let verdict = if report.is_consistent() {
        "consistent".green()
    } else {
        format!("lost updates (off by {})", report.deviation()).red()
    };
    let mut out = format!(
        "{:<15} final = {:>8}  [{}]  {} workers x {} cycles in {:?}",
        discipline_label(report.discipline),
        report.final_value,
        verdict,
        report.params.workers,
        report.params.iterations,
        report.elapsed
    );
    for fault in &report.faults {
        out.push_str(&format!("\n  {} {}", "fault:".red(), fault));
    }
    out
}

fn state_label(state: RoutineState) -> colored::ColoredString {
    match state {
        RoutineState::Acquired => state.to_string().green(),
        RoutineState::TimedOut => state.to_string().yellow(),
        _ => state.to_string().red(),
    }
}

pub fn render_scenario(report: &ScenarioReport) -> String {
    let header = if report.completed {
        format!("{} finished in {:?}", report.mode, report.elapsed).normal()
    } else {
        format!("{} stalled after {:?} (deadlock)", report.mode, report.elapsed).red()
    };
    format!(
        "{}\n  routine-a: {}\n  routine-b: {}",
        header,
        state_label(report.routine_a),
        state_label(report.routine_b)
    )
}

pub fn render_probe(probe: &ProbeReport) -> String {
    format!("bounded acquire {} after {:?}", probe.outcome, probe.waited)
}

pub fn render_ticks(name: &str, outcome: &TickOutcome) -> String {
    if outcome.stopped {
        format!("{name} stopped after {} ticks", outcome.completed)
    } else {
        format!("{name} ran all {} ticks", outcome.completed)
    }
}

pub fn render_statuses(statuses: &[(&str, WorkerStatus)]) -> String {
    statuses
        .iter()
        .map(|(name, status)| format!("{name:<12} {status:?}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_spin(name: &str, priority: Priority, count: u64) -> String {
    format!("{name} with {priority:>11} priority has a count = {count:>13}")
}
