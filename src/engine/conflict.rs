use ulid::Ulid;

use crate::model::*;

use super::error::FieldError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Append window errors for `span` to `errors`. `max_duration` bounds the span length.
pub(crate) fn check_span(span: &Span, max_duration: Ms, errors: &mut Vec<FieldError>) {
    use crate::limits::*;
    if !span.is_valid() {
        errors.push(FieldError::new("end", "must be after start"));
        return;
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        errors.push(FieldError::new("start", "timestamp out of range"));
        return;
    }
    if span.duration_ms() > max_duration {
        errors.push(FieldError::new("end", "window too long"));
    }
}

/// Append an error when an optional text field exceeds `max` bytes.
pub(crate) fn check_len(field: &'static str, value: Option<&str>, max: usize, errors: &mut Vec<FieldError>) {
    if let Some(v) = value {
        if v.len() > max {
            errors.push(FieldError::new(field, format!("must be at most {max} bytes")));
        }
    }
}

/// Block check: the first block on this resource whose window intersects `span`.
pub fn find_blocking(rs: &ResourceState, span: &Span) -> Option<BlockInfo> {
    rs.overlapping_blocks(span).next().map(BlockInfo::from)
}

/// Reservation check: every CONFIRMED reservation intersecting `span`, ordered by start.
/// `exclude` skips the reservation being updated in place.
pub fn find_overlapping(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> Vec<ConflictInfo> {
    rs.overlapping_reservations(span)
        .filter(|r| r.is_confirmed() && Some(r.id) != exclude)
        .map(ConflictInfo::from)
        .collect()
}

/// Both answers at once, for callers that want to pre-flight a window.
pub fn conflict_report(rs: &ResourceState, span: &Span, exclude: Option<Ulid>) -> ConflictReport {
    ConflictReport {
        block: find_blocking(rs, span),
        overlaps: find_overlapping(rs, span, exclude),
    }
}
