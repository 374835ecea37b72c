//! One adjustment cycle: read rates, derive limits, reconcile both queues,
//! release the session, report.
//!
//! The cycle carries no state between invocations; the external timer that
//! launches the binary provides the cadence and the retry policy.

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ShaperConfig;
use crate::limits::{bits_to_kbps, compute_limit};
use crate::rate::{read_rate, Direction, MeasurementError, RateSample, RateSource};
use crate::routeros::RouterOsClient;
use crate::shaping::{reconcile, AppliedLimit, QueueState, ShapingError, ShapingTarget};
use crate::snmp::{Oid, SnmpClient};

/// Errors that kill the whole cycle before any queue is touched.
/// Per-direction failures are not here; they live in the report.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("cannot establish session with shaping device: {0}")]
    Connection(#[source] ShapingError),
    #[error(transparent)]
    Measurement(#[from] MeasurementError),
    #[error("shaping device failed during inspection: {0}")]
    Inspect(#[source] ShapingError),
}

/// Everything the cycle needs besides the two capability handles.
#[derive(Debug, Clone)]
pub struct CycleOptions {
    pub oid_downstream: Oid,
    pub oid_upstream: Oid,
    pub download_queue: String,
    pub upload_queue: String,
    pub margin: f64,
    pub dry_run: bool,
}

impl CycleOptions {
    pub fn from_config(config: &ShaperConfig, dry_run: bool) -> Self {
        Self {
            oid_downstream: config.modem.oid_downstream.clone(),
            oid_upstream: config.modem.oid_upstream.clone(),
            download_queue: config.router.download_queue.clone(),
            upload_queue: config.router.upload_queue.clone(),
            margin: config.shaping.margin,
            dry_run,
        }
    }
}

/// What happened to one direction.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DirectionOutcome {
    Applied(AppliedLimit),
    Skipped { queue: String, reason: String },
}

impl DirectionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, DirectionOutcome::Applied(_))
    }
}

/// Terminal artifact of one cycle; logged, printed, then discarded.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub downstream: RateSample,
    pub upstream: RateSample,
    pub download: DirectionOutcome,
    pub upload: DirectionOutcome,
    pub dry_run: bool,
}

impl CycleReport {
    /// Both directions reconciled (verified or not). Partial success is the
    /// caller's policy decision, not an error.
    pub fn fully_applied(&self) -> bool {
        self.download.is_applied() && self.upload.is_applied()
    }
}

/// Drive one full cycle against an already-connected target.
///
/// Takes the target by value so the session is closed on every path,
/// including measurement failure. Nothing is written to the device before
/// both rate samples have validated.
pub async fn run_cycle<S, T>(
    source: &S,
    mut target: T,
    options: &CycleOptions,
) -> Result<CycleReport, CycleError>
where
    S: RateSource + ?Sized,
    T: ShapingTarget,
{
    let outcome = drive(source, &mut target, options).await;
    if let Err(e) = target.close().await {
        warn!(error = %e, "failed to close shaping session cleanly");
    }
    let report = outcome?;
    log_summary(&report);
    Ok(report)
}

async fn drive<S, T>(
    source: &S,
    target: &mut T,
    options: &CycleOptions,
) -> Result<CycleReport, CycleError>
where
    S: RateSource + ?Sized,
    T: ShapingTarget,
{
    let downstream = read_rate(source, Direction::Downstream, &options.oid_downstream).await?;
    let upstream = read_rate(source, Direction::Upstream, &options.oid_upstream).await?;
    info!(
        "DSL downstream/upstream attainable rates: {}/{} bps ({}/{} kbps)",
        downstream.bits_per_second,
        upstream.bits_per_second,
        bits_to_kbps(downstream.bits_per_second),
        bits_to_kbps(upstream.bits_per_second),
    );

    let download_limit = compute_limit(downstream.bits_per_second, options.margin);
    let upload_limit = compute_limit(upstream.bits_per_second, options.margin);

    let download =
        reconcile_direction(target, &options.download_queue, download_limit, options.dry_run)
            .await;
    let upload =
        reconcile_direction(target, &options.upload_queue, upload_limit, options.dry_run).await;

    Ok(CycleReport {
        downstream,
        upstream,
        download,
        upload,
        dry_run: options.dry_run,
    })
}

/// One direction's reconciliation, demoted from error to report entry: a
/// missing download queue must not stop the upload queue from tracking the
/// line.
async fn reconcile_direction<T: ShapingTarget>(
    target: &mut T,
    queue: &str,
    desired_bits: u64,
    dry_run: bool,
) -> DirectionOutcome {
    match reconcile(target, queue, desired_bits, dry_run).await {
        Ok(applied) => DirectionOutcome::Applied(applied),
        Err(e) => {
            warn!(queue = %queue, desired_max_limit = desired_bits, error = %e, "queue left unreconciled");
            DirectionOutcome::Skipped {
                queue: queue.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

fn describe(outcome: &DirectionOutcome) -> String {
    match outcome {
        DirectionOutcome::Applied(a) => a.effective_bits().to_string(),
        DirectionOutcome::Skipped { .. } => "skipped".to_string(),
    }
}

fn describe_kbps(outcome: &DirectionOutcome) -> String {
    match outcome {
        DirectionOutcome::Applied(a) => bits_to_kbps(a.effective_bits()).to_string(),
        DirectionOutcome::Skipped { .. } => "-".to_string(),
    }
}

fn log_summary(report: &CycleReport) {
    let verb = if report.dry_run { "staged" } else { "applied" };
    info!(
        "download/upload queue {} max-limits: {}/{} ({}/{} kbps)",
        verb,
        describe(&report.download),
        describe(&report.upload),
        describe_kbps(&report.download),
        describe_kbps(&report.upload),
    );
}

/// The `adjust` entry point: build the production clients from config and run
/// one cycle. Session acquisition failure means nothing was touched.
pub async fn adjust(config: &ShaperConfig, dry_run: bool) -> Result<CycleReport, CycleError> {
    let source = SnmpClient::new(
        config.modem.endpoint(),
        &config.modem.community,
        config.modem.timeout(),
    );
    let target = RouterOsClient::connect(
        config.router.endpoint(),
        &config.router.username,
        &config.router.password,
        config.router.timeout(),
    )
    .await
    .map_err(CycleError::Connection)?;

    run_cycle(&source, target, &CycleOptions::from_config(config, dry_run)).await
}

// ---------------------------------------------------------------------------
// Read-only inspection (the `show` subcommand)
// ---------------------------------------------------------------------------

/// Current vs. proposed view of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueView {
    pub queue: String,
    pub exists: bool,
    pub current_bits: Option<u64>,
    pub proposed_bits: u64,
}

/// Snapshot produced by `show`; never mutates the device.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    pub downstream: RateSample,
    pub upstream: RateSample,
    pub margin: f64,
    pub download: QueueView,
    pub upload: QueueView,
}

pub async fn inspect(config: &ShaperConfig) -> Result<InspectReport, CycleError> {
    let source = SnmpClient::new(
        config.modem.endpoint(),
        &config.modem.community,
        config.modem.timeout(),
    );
    let mut target = RouterOsClient::connect(
        config.router.endpoint(),
        &config.router.username,
        &config.router.password,
        config.router.timeout(),
    )
    .await
    .map_err(CycleError::Connection)?;

    let outcome = inspect_with(&source, &mut target, config).await;
    if let Err(e) = target.close().await {
        warn!(error = %e, "failed to close shaping session cleanly");
    }
    outcome
}

/// Inspection against injected capabilities, for tests and reuse.
pub async fn inspect_with<S, T>(
    source: &S,
    target: &mut T,
    config: &ShaperConfig,
) -> Result<InspectReport, CycleError>
where
    S: RateSource + ?Sized,
    T: ShapingTarget,
{
    let downstream = read_rate(source, Direction::Downstream, &config.modem.oid_downstream).await?;
    let upstream = read_rate(source, Direction::Upstream, &config.modem.oid_upstream).await?;

    let margin = config.shaping.margin;
    let download = queue_view(
        target,
        &config.router.download_queue,
        compute_limit(downstream.bits_per_second, margin),
    )
    .await?;
    let upload = queue_view(
        target,
        &config.router.upload_queue,
        compute_limit(upstream.bits_per_second, margin),
    )
    .await?;

    Ok(InspectReport {
        downstream,
        upstream,
        margin,
        download,
        upload,
    })
}

async fn queue_view<T: ShapingTarget>(
    target: &mut T,
    queue: &str,
    proposed_bits: u64,
) -> Result<QueueView, CycleError> {
    let state: Option<QueueState> = target
        .get_queue(queue)
        .await
        .map_err(CycleError::Inspect)?;
    Ok(QueueView {
        queue: queue.to_string(),
        exists: state.is_some(),
        current_bits: state.and_then(|s| s.max_limit_bits),
        proposed_bits,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shaping::testutil::FakeTarget;

    struct FakeSource {
        downstream: Result<i64, &'static str>,
        upstream: Result<i64, &'static str>,
    }

    impl FakeSource {
        fn ok(down: i64, up: i64) -> Self {
            Self {
                downstream: Ok(down),
                upstream: Ok(up),
            }
        }
    }

    #[async_trait::async_trait]
    impl RateSource for FakeSource {
        async fn read(&self, metric: &Oid) -> anyhow::Result<i64> {
            let result = if metric == &options().oid_downstream {
                self.downstream
            } else {
                self.upstream
            };
            result.map_err(|e| anyhow::anyhow!(e))
        }
    }

    fn options() -> CycleOptions {
        CycleOptions {
            oid_downstream: "1.3.6.1.2.1.10.94.1.1.2.1.8.1".parse().unwrap(),
            oid_upstream: "1.3.6.1.2.1.10.94.1.1.3.1.8.1".parse().unwrap(),
            download_queue: "download".to_string(),
            upload_queue: "upload".to_string(),
            margin: 0.10,
            dry_run: false,
        }
    }

    #[tokio::test]
    async fn test_happy_path_applies_both_directions() {
        let source = FakeSource::ok(50_676_736, 10_820_608);
        let mut target = FakeTarget::with_queues(&[
            ("download", Some(50_000_000)),
            ("upload", Some(10_000_000)),
        ]);

        let report = run_cycle(&source, &mut target, &options()).await.unwrap();

        assert!(report.fully_applied());
        assert!(target.closed);
        assert_eq!(target.queues["download"], Some(45_609_062));
        assert_eq!(target.queues["upload"], Some(9_738_547));
        match &report.download {
            DirectionOutcome::Applied(a) => {
                assert_eq!(a.previous_bits, Some(50_000_000));
                assert_eq!(a.applied_bits, Some(45_609_062));
                assert!(a.verified);
            }
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_measurement_failure_touches_nothing() {
        let source = FakeSource {
            downstream: Err("timed out"),
            upstream: Ok(10_820_608),
        };
        let mut target = FakeTarget::with_queues(&[
            ("download", Some(50_000_000)),
            ("upload", Some(10_000_000)),
        ]);

        let result = run_cycle(&source, &mut target, &options()).await;

        assert!(matches!(result, Err(CycleError::Measurement(_))));
        // No mutating call reached the device, but the session was released.
        assert!(target.set_calls.is_empty());
        assert!(target.closed);
        assert_eq!(target.queues["download"], Some(50_000_000));
    }

    #[tokio::test]
    async fn test_invalid_upstream_reading_touches_nothing() {
        let source = FakeSource::ok(50_676_736, 0);
        let mut target = FakeTarget::with_queues(&[("download", Some(1)), ("upload", Some(1))]);

        let result = run_cycle(&source, &mut target, &options()).await;

        assert!(matches!(
            result,
            Err(CycleError::Measurement(MeasurementError::Invalid { value: 0, .. }))
        ));
        assert!(target.set_calls.is_empty());
        assert!(target.closed);
    }

    #[tokio::test]
    async fn test_missing_queue_is_partial_success() {
        let source = FakeSource::ok(50_676_736, 10_820_608);
        // Only the upload queue exists on the device.
        let mut target = FakeTarget::with_queues(&[("upload", Some(10_000_000))]);

        let report = run_cycle(&source, &mut target, &options()).await.unwrap();

        assert!(!report.fully_applied());
        match &report.download {
            DirectionOutcome::Skipped { queue, reason } => {
                assert_eq!(queue, "download");
                assert!(reason.contains("not found"));
            }
            other => panic!("expected Skipped, got {:?}", other),
        }
        // The other direction still went through.
        assert!(report.upload.is_applied());
        assert_eq!(target.queues["upload"], Some(9_738_547));
        assert!(target.closed);
    }

    #[tokio::test]
    async fn test_dry_run_stages_without_writing() {
        let source = FakeSource::ok(50_676_736, 10_820_608);
        let mut target = FakeTarget::with_queues(&[
            ("download", Some(50_000_000)),
            ("upload", Some(10_000_000)),
        ]);
        let mut opts = options();
        opts.dry_run = true;

        let report = run_cycle(&source, &mut target, &opts).await.unwrap();

        assert!(report.fully_applied());
        assert!(target.set_calls.is_empty());
        assert_eq!(target.queues["download"], Some(50_000_000));
        match &report.download {
            DirectionOutcome::Applied(a) => {
                assert!(a.staged);
                assert_eq!(a.effective_bits(), 45_609_062);
            }
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clamping_device_reports_unverified() {
        let source = FakeSource::ok(50_676_736, 10_820_608);
        let mut target = FakeTarget::with_queues(&[
            ("download", Some(50_000_000)),
            ("upload", Some(10_000_000)),
        ]);
        target.clamp_to = Some(40_000_000);

        let report = run_cycle(&source, &mut target, &options()).await.unwrap();

        // Mismatch is warned about, never fatal.
        assert!(report.fully_applied());
        match &report.download {
            DirectionOutcome::Applied(a) => {
                assert!(!a.verified);
                assert_eq!(a.applied_bits, Some(40_000_000));
            }
            other => panic!("expected Applied, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inspect_never_writes() {
        let source = FakeSource::ok(50_676_736, 10_820_608);
        let mut target = FakeTarget::with_queues(&[("download", Some(50_000_000))]);
        let config = ShaperConfig::default();

        let report = inspect_with(&source, &mut target, &config).await.unwrap();

        assert!(target.set_calls.is_empty());
        assert!(report.download.exists);
        assert_eq!(report.download.current_bits, Some(50_000_000));
        assert_eq!(report.download.proposed_bits, 45_609_062);
        assert!(!report.upload.exists);
        assert_eq!(report.upload.proposed_bits, 9_738_547);
    }
}
