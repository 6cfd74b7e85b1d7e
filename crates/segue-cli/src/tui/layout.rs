//! Layout management for adaptive terminal sizing

use ratatui::layout::{Constraint, Direction, Layout, Rect};

/// Header, slots and events side by side, log, footer
pub struct LayoutSlots {
    pub header: Rect,
    pub slots: Rect,
    pub events: Rect,
    pub log: Rect,
    pub footer: Rect,
}

pub fn create_layout(area: Rect) -> LayoutSlots {
    let log_height = match area.height {
        0..=29 => 5,
        30..=49 => 8,
        _ => 12,
    };

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),          // Transport header
            Constraint::Min(6),             // Slots and events
            Constraint::Length(log_height), // Log
            Constraint::Length(3),          // Footer
        ])
        .split(area);

    let middle = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Length(28), Constraint::Min(20)])
        .split(rows[1]);

    LayoutSlots {
        header: rows[0],
        slots: middle[0],
        events: middle[1],
        log: rows[2],
        footer: rows[3],
    }
}

/// Centered rectangle of at most `width` x `height` inside `area`.
pub fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width - width) / 2,
        y: area.y + (area.height - height) / 2,
        width,
        height,
    }
}

/// Truncate a string to fit within a given width
pub fn truncate_string(s: &str, max_width: usize) -> String {
    if s.chars().count() <= max_width {
        s.to_string()
    } else if max_width <= 3 {
        s.chars().take(max_width).collect()
    } else {
        let mut result: String = s.chars().take(max_width - 3).collect();
        result.push_str("...");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("segment", 10), "segment");
        assert_eq!(truncate_string("regenerate", 7), "rege...");
        assert_eq!(truncate_string("abc", 2), "ab");
    }

    #[test]
    fn test_centered_fits_inside() {
        let area = Rect::new(0, 0, 40, 10);
        let inner = centered(area, 100, 4);
        assert_eq!(inner.width, 40);
        assert_eq!(inner.height, 4);
        assert_eq!(inner.y, 3);
    }
}
