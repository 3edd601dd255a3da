//! pvt CLI
//!
//! Colors and formatting for decisions, reports and the loop's logs.

use crate::logging::{ChatMessage, Speaker, StatusEntry, StatusLevel};
use crate::vla::{GroundedAction, GroundedDecision, KnowledgeReport, PerceptualState};
use console::style;

pub const BANNER_TEXT: &str = r#"
  ██████  ██    ██ ████████
  ██   ██ ██    ██    ██
  ██████  ██    ██    ██
  ██       ██  ██     ██
  ██        ████      ██
"#;

pub fn print_banner() {
    println!("{}", style(BANNER_TEXT).cyan().bold());
    println!("{}", style("        see · decide · act").dim());
    println!();
}

pub fn print_info(msg: &str) {
    println!("{} {}", style("ℹ").cyan(), msg);
}

pub fn print_success(msg: &str) {
    println!("{} {}", style("✓").green().bold(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", style("✗").red().bold(), msg);
}

pub fn print_warning(msg: &str) {
    println!("{} {}", style("⚠").yellow().bold(), msg);
}

pub fn print_state(state: &PerceptualState) {
    println!(
        "{} {}x{}, {} text block(s)",
        style("Screen").bold(),
        state.image_width(),
        state.image_height(),
        state.blocks().len()
    );
    println!("  {}", style(state.describe(15)).dim());
}

pub fn print_decision(decision: &GroundedDecision) {
    let action = match &decision.action {
        Some(GroundedAction::Click { x, y, target }) => format!("CLICK \"{}\" at ({}, {})", target, x, y),
        Some(GroundedAction::Type { text }) => format!("TYPE \"{}\"", text),
        Some(GroundedAction::Wait { duration_ms }) => format!("WAIT {}ms", duration_ms),
        None if decision.stop_requested => "ABORT".to_string(),
        None => "no action".to_string(),
    };

    if decision.is_confident {
        print_success(&action);
    } else {
        print_warning(&format!("not confident: {}", action));
    }
    println!("  {}", style(&decision.reasoning).dim());
}

pub fn print_report(report: &KnowledgeReport) {
    for task in &report.tasks {
        let badge = if task.task_known {
            style("[KNOWN]".to_string()).green()
        } else {
            style(format!("[{}%]", task.confidence())).yellow()
        };
        println!("{} {}", badge, style(&task.task).bold());
        for step in &task.steps {
            let mark = if step.is_known { style("✓").green() } else { style("?").yellow() };
            println!(
                "   {} {} {}",
                mark,
                step.step_text,
                style(format!("({:.2})", step.similarity_score)).dim()
            );
        }
    }
    println!();
    println!("{} {}%", style("Overall confidence:").bold(), report.confidence);
}

pub fn print_status(entry: &StatusEntry) {
    let line = entry.to_string();
    match entry.level {
        StatusLevel::Info => println!("{}", style(line).dim()),
        StatusLevel::Warning => println!("{}", style(line).yellow()),
        StatusLevel::Error => println!("{}", style(line).red()),
    }
}

pub fn print_chat(message: &ChatMessage) {
    match message.speaker {
        Speaker::Robot => println!("{} {}", style("pvt ›").magenta().bold(), message.text),
        Speaker::User => println!("{} {}", style("you ›").cyan(), message.text),
    }
}
