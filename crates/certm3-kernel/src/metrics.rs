//! Prometheus metric surface for the middleware, via the `metrics` facade.
//!
//! Counters carry a `_total` suffix, histograms record seconds, gauges have
//! no suffix. The gateway installs the Prometheus recorder and serves the
//! scrape endpoint; the signer records through the same helpers (a no-op
//! unless a recorder is installed in that process).

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

// HTTP surface
const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
const HTTP_REQUEST_DURATION: &str = "http_request_duration_seconds";
const HTTP_REQUESTS_IN_FLIGHT: &str = "http_requests_in_flight";

// Business flow
const CSR_SIGNING_TOTAL: &str = "csr_signing_total";
const CSR_SIGNING_DURATION: &str = "csr_signing_duration_seconds";
const CSR_SIGNING_ERRORS: &str = "csr_signing_errors_total";
const CERTIFICATE_REQUESTS_TOTAL: &str = "certificate_requests_total";
const EMAIL_VALIDATIONS_TOTAL: &str = "email_validations_total";
const ACTIVE_USERS: &str = "active_users";
const ACTIVE_CERTIFICATES: &str = "active_certificates";

// Security
const JWT_VALIDATIONS_TOTAL: &str = "jwt_validations_total";
const JWT_VALIDATION_ERRORS: &str = "jwt_validation_errors_total";
const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded_total";
const SECURITY_EVENTS_TOTAL: &str = "security_events_total";

// Registry backend
const BACKEND_REQUESTS_TOTAL: &str = "backend_requests_total";
const BACKEND_REQUEST_DURATION: &str = "backend_request_duration_seconds";
const BACKEND_REQUEST_ERRORS: &str = "backend_request_errors_total";

/// Registers help text for every metric. Call once after installing the
/// recorder.
pub fn describe_all() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests");
    describe_histogram!(HTTP_REQUEST_DURATION, "HTTP request duration in seconds");
    describe_gauge!(
        HTTP_REQUESTS_IN_FLIGHT,
        "Current number of HTTP requests being served"
    );
    describe_counter!(CSR_SIGNING_TOTAL, "Total number of CSR signing operations");
    describe_histogram!(CSR_SIGNING_DURATION, "CSR signing duration in seconds");
    describe_counter!(CSR_SIGNING_ERRORS, "Total number of CSR signing errors");
    describe_counter!(
        CERTIFICATE_REQUESTS_TOTAL,
        "Total number of certificate requests"
    );
    describe_counter!(EMAIL_VALIDATIONS_TOTAL, "Total number of email validations");
    describe_gauge!(ACTIVE_USERS, "Number of active users");
    describe_gauge!(ACTIVE_CERTIFICATES, "Number of active certificates");
    describe_counter!(JWT_VALIDATIONS_TOTAL, "Total number of JWT validations");
    describe_counter!(
        JWT_VALIDATION_ERRORS,
        "Total number of JWT validation errors"
    );
    describe_counter!(
        RATE_LIMIT_EXCEEDED,
        "Total number of rate limit exceeded events"
    );
    describe_counter!(SECURITY_EVENTS_TOTAL, "Total number of security events");
    describe_counter!(
        BACKEND_REQUESTS_TOTAL,
        "Total number of backend API requests"
    );
    describe_histogram!(
        BACKEND_REQUEST_DURATION,
        "Backend API request duration in seconds"
    );
    describe_counter!(
        BACKEND_REQUEST_ERRORS,
        "Total number of backend API request errors"
    );
}

#[inline]
pub fn record_http_request(method: &str, path: &str, status: u16, duration: Duration) {
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
    histogram!(
        HTTP_REQUEST_DURATION,
        "method" => method.to_string(),
        "path" => path.to_string(),
    )
    .record(duration.as_secs_f64());
}

#[inline]
pub fn http_in_flight_inc(method: &str, path: &str) {
    gauge!(
        HTTP_REQUESTS_IN_FLIGHT,
        "method" => method.to_string(),
        "path" => path.to_string(),
    )
    .increment(1.0);
}

#[inline]
pub fn http_in_flight_dec(method: &str, path: &str) {
    gauge!(
        HTTP_REQUESTS_IN_FLIGHT,
        "method" => method.to_string(),
        "path" => path.to_string(),
    )
    .decrement(1.0);
}

/// Records one signer round-trip (gateway side) or one signing operation
/// (signer side).
#[inline]
pub fn record_csr_signing(status: &str, duration: Duration, error: Option<&str>) {
    counter!(CSR_SIGNING_TOTAL, "status" => status.to_string()).increment(1);
    histogram!(CSR_SIGNING_DURATION, "status" => status.to_string())
        .record(duration.as_secs_f64());
    if let Some(error_type) = error {
        counter!(CSR_SIGNING_ERRORS, "error_type" => error_type.to_string()).increment(1);
    }
}

#[inline]
pub fn record_certificate_request(status: &str) {
    counter!(CERTIFICATE_REQUESTS_TOTAL, "status" => status.to_string()).increment(1);
}

#[inline]
pub fn record_email_validation(status: &str) {
    counter!(EMAIL_VALIDATIONS_TOTAL, "status" => status.to_string()).increment(1);
}

#[inline]
pub fn record_jwt_validation(status: &str, error: Option<&str>) {
    counter!(JWT_VALIDATIONS_TOTAL, "status" => status.to_string()).increment(1);
    if let Some(error_type) = error {
        counter!(JWT_VALIDATION_ERRORS, "error_type" => error_type.to_string()).increment(1);
    }
}

#[inline]
pub fn record_rate_limit_exceeded(path: &str) {
    counter!(RATE_LIMIT_EXCEEDED, "path" => path.to_string()).increment(1);
}

#[inline]
pub fn record_security_event(event_type: &str) {
    counter!(SECURITY_EVENTS_TOTAL, "event_type" => event_type.to_string()).increment(1);
}

#[inline]
pub fn record_backend_request(method: &str, path: &str, status: &str, duration: Duration) {
    counter!(
        BACKEND_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "path" => path.to_string(),
        "status" => status.to_string(),
    )
    .increment(1);
    histogram!(
        BACKEND_REQUEST_DURATION,
        "method" => method.to_string(),
        "path" => path.to_string(),
    )
    .record(duration.as_secs_f64());
}

#[inline]
pub fn record_backend_error(error_type: &str) {
    counter!(BACKEND_REQUEST_ERRORS, "error_type" => error_type.to_string()).increment(1);
}

#[inline]
pub fn set_active_users(count: f64) {
    gauge!(ACTIVE_USERS).set(count);
}

#[inline]
pub fn set_active_certificates(count: f64) {
    gauge!(ACTIVE_CERTIFICATES).set(count);
}
