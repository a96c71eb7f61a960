//! Validation helpers for DTOs.

use validator::ValidationError;

/// Validates that a run duration is a finite, non-negative number of seconds.
///
/// # Examples
///
/// ```ignore
/// validate_run_time(120.5)          // Ok
/// validate_run_time(-1.0)           // Err - negative
/// validate_run_time(f64::INFINITY)  // Err - not finite
/// ```
pub fn validate_run_time(time: f64) -> Result<(), ValidationError> {
    if !time.is_finite() {
        let mut err = ValidationError::new("time_not_finite");
        err.message = Some("Time must be a finite number of seconds".into());
        return Err(err);
    }

    if time < 0.0 {
        let mut err = ValidationError::new("time_negative");
        err.message = Some(format!("Time must not be negative (got {time})").into());
        return Err(err);
    }

    Ok(())
}
