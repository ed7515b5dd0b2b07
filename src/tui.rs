use anyhow::Result;
use crossterm::{
    ExecutableCommand,
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use std::io::stdout;
use std::sync::Arc;
use std::time::Duration;

use crate::models::{FilterStatus, JobPhase, JobState};
use crate::state::JobStateManager;

/// Visual summary of one job's state: a one-character badge plus a color.
pub struct Indicator {
    pub badge: &'static str,
    pub color: Color,
}

pub fn indicator(state: &JobState) -> Indicator {
    match state.phase {
        JobPhase::Initial => Indicator {
            badge: " ",
            color: Color::DarkGray,
        },
        JobPhase::Filtering => Indicator {
            badge: "*",
            color: Color::Yellow,
        },
        JobPhase::Error => Indicator {
            badge: "!",
            color: Color::Red,
        },
        JobPhase::Blacklisted => Indicator {
            badge: "B",
            color: Color::Red,
        },
        JobPhase::Complete => {
            let status = state
                .result
                .as_ref()
                .map_or(FilterStatus::Unknown, |r| r.status);
            match status {
                FilterStatus::ConfirmedMatch => Indicator {
                    badge: "+",
                    color: Color::Green,
                },
                FilterStatus::LikelyMatch => Indicator {
                    badge: "+",
                    color: Color::Cyan,
                },
                FilterStatus::PossibleMatch => Indicator {
                    badge: "?",
                    color: Color::Yellow,
                },
                FilterStatus::NotLikely => Indicator {
                    badge: "-",
                    color: Color::DarkGray,
                },
                FilterStatus::ConfirmedNoMatch => Indicator {
                    badge: "x",
                    color: Color::Red,
                },
                FilterStatus::Unknown => Indicator {
                    badge: "?",
                    color: Color::DarkGray,
                },
                FilterStatus::Error => Indicator {
                    badge: "!",
                    color: Color::Red,
                },
            }
        }
    }
}

struct AppState {
    rows: Vec<(String, JobState)>,
    selected: usize,
    scroll_offset: u16,
}

impl AppState {
    fn new() -> Self {
        Self {
            rows: Vec::new(),
            selected: 0,
            scroll_offset: 0,
        }
    }

    fn refresh(&mut self, states: &JobStateManager) {
        let mut rows: Vec<(String, JobState)> = states.snapshot().into_iter().collect();
        // Stable ordering so the list does not jump while jobs update.
        rows.sort_by(|a, b| {
            let ta = a.1.record.as_ref().map(|r| r.title.as_str()).unwrap_or("");
            let tb = b.1.record.as_ref().map(|r| r.title.as_str()).unwrap_or("");
            ta.cmp(tb).then_with(|| a.0.cmp(&b.0))
        });
        self.rows = rows;
        if self.selected >= self.rows.len() && !self.rows.is_empty() {
            self.selected = self.rows.len() - 1;
        }
    }

    fn current(&self) -> Option<&(String, JobState)> {
        self.rows.get(self.selected)
    }

    fn next(&mut self) {
        if !self.rows.is_empty() && self.selected < self.rows.len() - 1 {
            self.selected += 1;
            self.scroll_offset = 0;
        }
    }

    fn prev(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
            self.scroll_offset = 0;
        }
    }
}

/// Live dashboard over the state manager. Blocking; run it on a dedicated
/// thread (`spawn_blocking`) next to the async pipeline.
pub fn run_dashboard(states: Arc<JobStateManager>) -> Result<()> {
    let mut app = AppState::new();
    app.refresh(&states);

    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut app, &states);

    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    app: &mut AppState,
    states: &JobStateManager,
) -> Result<()> {
    let mut list_state = ListState::default();
    list_state.select(Some(0));

    loop {
        app.refresh(states);
        terminal.draw(|frame| draw(frame, app, &mut list_state))?;

        if !event::poll(Duration::from_millis(200))? {
            continue;
        }
        if let Event::Key(key) = event::read()? {
            if key.kind != KeyEventKind::Press {
                continue;
            }
            match key.code {
                KeyCode::Char('q') | KeyCode::Esc => break,
                KeyCode::Down | KeyCode::Char('j') => app.next(),
                KeyCode::Up | KeyCode::Char('k') => app.prev(),
                KeyCode::Char('J') | KeyCode::PageDown => {
                    app.scroll_offset = app.scroll_offset.saturating_add(3);
                }
                KeyCode::Char('K') | KeyCode::PageUp => {
                    app.scroll_offset = app.scroll_offset.saturating_sub(3);
                }
                _ => {}
            }
            list_state.select(Some(app.selected));
        }
    }
    Ok(())
}

fn draw(frame: &mut Frame, app: &AppState, list_state: &mut ListState) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(frame.area());

    // Left panel: one row per job.
    let items: Vec<ListItem> = app
        .rows
        .iter()
        .map(|(job_id, state)| {
            let ind = indicator(state);
            let (title, company) = match &state.record {
                Some(r) => (r.title.as_str(), r.company.as_str()),
                None => ("?", "?"),
            };
            let title = crate::truncate(title, 32);
            ListItem::new(Line::from(vec![
                Span::styled(format!("{} ", ind.badge), Style::default().fg(ind.color)),
                Span::raw(format!("{} | {} ", title, company)),
                Span::styled(format!("({})", job_id), Style::default().fg(Color::DarkGray)),
            ]))
        })
        .collect();

    let pending = app
        .rows
        .iter()
        .filter(|(_, s)| !s.is_terminal())
        .count();
    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(format!(
            " Jobs ({}, {} in progress) ",
            app.rows.len(),
            pending
        )))
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, chunks[0], list_state);

    // Right panel: detail for the selected job.
    let detail = build_detail(app);
    let detail_widget = Paragraph::new(detail)
        .block(Block::default().borders(Borders::ALL).title(" Detail "))
        .wrap(Wrap { trim: false })
        .scroll((app.scroll_offset, 0));
    frame.render_widget(detail_widget, chunks[1]);

    let help_area = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(frame.area());
    let help = Paragraph::new(" j/k:navigate  J/K:scroll  q:quit")
        .style(Style::default().fg(Color::DarkGray));
    frame.render_widget(help, help_area[1]);
}

fn build_detail(app: &AppState) -> Text<'_> {
    let Some((job_id, state)) = app.current() else {
        return Text::raw("Waiting for listings...");
    };

    let mut lines: Vec<Line> = Vec::new();

    if let Some(record) = &state.record {
        lines.push(Line::from(Span::styled(
            record.title.clone(),
            Style::default().add_modifier(Modifier::BOLD),
        )));
        lines.push(Line::from(format!("at {}", record.company)));
        if !record.location.is_empty() {
            lines.push(Line::from(record.location.clone()));
        }
        if record.rating.is_valid {
            lines.push(Line::from(format!(
                "Rating: {:.1} ({} reviews)",
                record.rating.rating, record.rating.review_count
            )));
        }
    }
    lines.push(Line::from(Span::styled(
        format!("Job id: {}", job_id),
        Style::default().fg(Color::DarkGray),
    )));

    let ind = indicator(state);
    let phase_label = match state.phase {
        JobPhase::Initial => "initial".to_string(),
        JobPhase::Filtering => "filtering".to_string(),
        JobPhase::Blacklisted => "blacklisted".to_string(),
        JobPhase::Error => "error".to_string(),
        JobPhase::Complete => state
            .result
            .as_ref()
            .map_or("complete".to_string(), |r| r.status.as_str().to_string()),
    };
    lines.push(Line::from(Span::styled(
        format!("Status: {}", phase_label),
        Style::default().fg(ind.color),
    )));
    lines.push(Line::from(""));

    if let Some(result) = &state.result {
        if !result.reasons.is_empty() {
            lines.push(Line::from(Span::styled(
                "Reasons",
                Style::default().add_modifier(Modifier::BOLD),
            )));
            for reason in &result.reasons {
                for line in textwrap::fill(reason, 70).lines() {
                    lines.push(Line::from(format!("  {}", line)));
                }
            }
            lines.push(Line::from(""));
        }
        if let Some(score) = result.title_score {
            lines.push(Line::from(format!("Title score: {:.2}", score)));
        }
    }

    if !state.tooltip.is_empty() {
        for line in textwrap::fill(&state.tooltip, 70).lines() {
            lines.push(Line::from(Span::styled(
                line.to_string(),
                Style::default().fg(Color::DarkGray),
            )));
        }
    }

    Text::from(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FilterResult;

    fn state_with(phase: JobPhase, status: Option<FilterStatus>) -> JobState {
        let mut state = JobState::new();
        state.phase = phase;
        state.result = status.map(|s| FilterResult::with_status(s, vec![]));
        state
    }

    #[test]
    fn test_indicator_phase_mapping() {
        assert_eq!(indicator(&state_with(JobPhase::Filtering, None)).badge, "*");
        assert_eq!(indicator(&state_with(JobPhase::Error, None)).badge, "!");
        assert_eq!(
            indicator(&state_with(JobPhase::Blacklisted, None)).badge,
            "B"
        );
    }

    #[test]
    fn test_indicator_complete_uses_result_status() {
        let ind = indicator(&state_with(
            JobPhase::Complete,
            Some(FilterStatus::ConfirmedMatch),
        ));
        assert_eq!(ind.badge, "+");
        assert_eq!(ind.color, Color::Green);

        let ind = indicator(&state_with(
            JobPhase::Complete,
            Some(FilterStatus::ConfirmedNoMatch),
        ));
        assert_eq!(ind.badge, "x");
        assert_eq!(ind.color, Color::Red);
    }

    #[test]
    fn test_indicator_complete_without_result_is_unknown() {
        let ind = indicator(&state_with(JobPhase::Complete, None));
        assert_eq!(ind.badge, "?");
        assert_eq!(ind.color, Color::DarkGray);
    }
}
