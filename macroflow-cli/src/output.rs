use colored::*;
use macroflow::engine::{RunEvent, StepOutcome, TraceEntry};
use macroflow::step::{LoopMode, MacroStep, StepKind};
use macroflow::storage::MacroSummary;
use macroflow::{Macro, MatchResult, RunOutcome, RunReport};

pub fn print_macro_tree(document: &Macro) {
    println!("{} {}", document.name.bold(), format!("[{}]", document.id).dimmed());
    if !document.description.is_empty() {
        println!("  {}", document.description);
    }
    if !document.variables.is_empty() {
        println!("\n{}", "Variables:".yellow().bold());
        for (name, value) in &document.variables {
            println!("  {} = {:?}", name.cyan(), value);
        }
    }
    println!("\n{}", "Steps:".yellow().bold());
    print_steps(&document.steps, 1);
}

fn print_steps(steps: &[MacroStep], indent: usize) {
    for step in steps {
        let pad = "  ".repeat(indent);
        let name = if step.enabled {
            step.display_name().normal()
        } else {
            format!("{} (disabled)", step.display_name()).dimmed()
        };
        println!("{pad}{} {}{}", "•".cyan(), name, describe(step).dimmed());
        match &step.kind {
            StepKind::IfCondition(c) => {
                println!("{pad}  {}", "then:".green());
                print_steps(&c.true_branch, indent + 2);
                if !c.false_branch.is_empty() {
                    println!("{pad}  {}", "else:".red());
                    print_steps(&c.false_branch, indent + 2);
                }
            }
            StepKind::Loop(l) => print_steps(&l.body, indent + 1),
            _ => {}
        }
    }
}

fn describe(step: &MacroStep) -> String {
    match &step.kind {
        StepKind::MouseClick(c) => format!(" {} at ({}, {})", c.button, c.x, c.y),
        StepKind::MouseMove(m) => format!(" to ({}, {})", m.x, m.y),
        StepKind::KeyboardType(t) => format!(" {:?}", t.text),
        StepKind::KeyboardHotkey(h) => format!(" {}", h.keys.join("+")),
        StepKind::WaitTime(w) => format!(" {}ms", w.duration_ms),
        StepKind::WaitImage(w) => format!(" {} (timeout {}ms)", w.template_ref, w.timeout_ms),
        StepKind::TextSearch(t) => format!(" {:?} (timeout {}ms)", t.query_text, t.timeout_ms),
        StepKind::IfCondition(c) => format!(" if {}", c.condition),
        StepKind::Loop(l) => match &l.mode {
            LoopMode::Count(n) => format!(" x{n}"),
            LoopMode::While(c) => format!(" while {} (max {})", c, l.max_iterations),
        },
    }
}

/// One line of live progress for a run event.
pub fn print_event(event: &RunEvent) {
    match event {
        RunEvent::StepFinished { entry, .. } => print_entry(entry),
        RunEvent::Warning { warning, .. } => println!("  {} {}", "⚠".yellow(), warning),
        _ => {}
    }
}

fn print_entry(entry: &TraceEntry) {
    let pad = "  ".repeat(entry.depth + 1);
    let icon = match &entry.outcome {
        StepOutcome::Success | StepOutcome::Branch { .. } => "✓".green(),
        StepOutcome::Loop { limited: true, .. } => "⚠".yellow(),
        StepOutcome::Loop { .. } => "✓".green(),
        StepOutcome::Skip => "⏭".yellow(),
        StepOutcome::Timeout | StepOutcome::Error | StepOutcome::Aborted => "✗".red(),
    };
    let mut line = format!("{pad}{icon} {entry}");
    if entry.attempts > 1 {
        line.push_str(&format!(" after {} attempts", entry.attempts));
    }
    if let Some(error) = &entry.error {
        line.push_str(&format!(" {}", format!("({error})").dimmed()));
    }
    println!("{line}");
    if !entry.unresolved.is_empty() {
        println!("{pad}  {} unresolved: {}", "⚠".yellow(), entry.unresolved.join(", "));
    }
}

pub fn print_report(report: &RunReport) {
    println!();
    let status = match &report.outcome {
        RunOutcome::Completed => "✅ COMPLETED".green().bold(),
        RunOutcome::Aborted { .. } => "⏹  ABORTED".yellow().bold(),
        RunOutcome::Failed { .. } => "❌ FAILED".red().bold(),
    };
    let millis = report.duration().num_milliseconds();
    println!("{} {} in {:.2}s", status, report.macro_name, millis as f64 / 1000.0);
    if !report.outcome.is_completed() {
        println!("  {}", report.outcome);
    }

    let problems: Vec<&TraceEntry> = report.problems().collect();
    if !problems.is_empty() {
        println!("\n{}", "Problems:".red().bold());
        for entry in problems {
            println!("  {} {}", "✗".red(), entry);
        }
    }
    if !report.warnings.is_empty() {
        println!("\n{}", "Warnings:".yellow().bold());
        for warning in &report.warnings {
            println!("  {} {}", "⚠".yellow(), warning);
        }
    }
    println!(
        "\n{} steps recorded, {} problem(s)",
        report.trace.len(),
        report.problems().count()
    );
}

pub fn print_library(entries: &[MacroSummary]) {
    if entries.is_empty() {
        println!("{}", "No macros found".dimmed());
        return;
    }
    for entry in entries {
        let updated = entry.updated_at.format("%Y-%m-%d %H:%M");
        println!(
            "{} {} {}",
            entry.name.bold(),
            format!("({} steps, updated {updated})", entry.step_count).dimmed(),
            entry.path.display()
        );
        if !entry.description.is_empty() {
            println!("  {}", entry.description);
        }
    }
}

pub fn print_text_results(results: &[MatchResult]) {
    if results.is_empty() {
        println!("{}", "No text recognized".dimmed());
        return;
    }
    for r in results {
        println!(
            "{} {} {}",
            format!("({:>5}, {:>5})", r.center.x, r.center.y).cyan(),
            r.label,
            format!("{:.2}", r.confidence).dimmed()
        );
    }
}
