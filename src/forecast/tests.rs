use super::{ForecastParams, ForecastUnit, IngestOutcome, ModelKind, NotReady, UnitState};
use crate::error::{IngestError, OrderingAnomaly};
use crate::telemetry::SensorEvent;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

const SENSOR: &str = "S1";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn event(minute: i64, value: f64) -> SensorEvent {
    SensorEvent::new(SENSOR, t0() + ChronoDuration::minutes(minute), value)
}

fn linear(minute: i64) -> SensorEvent {
    event(minute, 20.0 + 0.1 * minute as f64)
}

fn holt(min_samples: usize) -> ForecastParams {
    ForecastParams {
        model: ModelKind::Holt,
        alpha: 0.5,
        beta: 0.3,
        min_samples,
        horizon: ChronoDuration::minutes(10),
        ..ForecastParams::default()
    }
}

fn feed(unit: &mut ForecastUnit, events: impl IntoIterator<Item = SensorEvent>) {
    for ev in events {
        unit.ingest(&ev).expect("ingest");
    }
}

#[test]
fn linear_trend_forecast_extrapolates_ten_minutes() {
    let mut unit = ForecastUnit::new(SENSOR, holt(20));
    feed(&mut unit, (0..50).map(linear));

    let result = unit.forecast().expect("ready");
    assert_eq!(result.sensor_id, SENSOR);
    assert_eq!(result.as_of, t0() + ChronoDuration::minutes(49));
    assert_eq!(result.target_time, t0() + ChronoDuration::minutes(59));
    assert_eq!(result.horizon_secs, 600);
    assert!(
        (result.predicted_value - 25.9).abs() < 1e-6,
        "got {}",
        result.predicted_value
    );
    assert_eq!(unit.last_forecast(), Some(&result));
}

#[test]
fn no_forecast_below_min_samples() {
    let mut unit = ForecastUnit::new(SENSOR, holt(20));
    assert_eq!(unit.state(), UnitState::Cold);
    assert_eq!(unit.forecast(), Err(NotReady::Cold));

    feed(&mut unit, (0..19).map(linear));
    assert_eq!(unit.state(), UnitState::Warming);
    assert_eq!(unit.forecast(), Err(NotReady::Warming));
    assert_eq!(unit.seed_len(), 19);

    feed(&mut unit, [linear(19)]);
    assert_eq!(unit.state(), UnitState::Ready);
    assert!(unit.is_initialized());
    assert!(unit.forecast().is_ok());
}

#[test]
fn identical_input_gives_identical_forecasts() {
    let params = ForecastParams {
        season_length: 4,
        min_samples: 16,
        horizon: ChronoDuration::minutes(3),
        ..ForecastParams::default()
    };
    let series: Vec<SensorEvent> = (0..60)
        .map(|i| event(i, 40.0 + (i % 4) as f64 + 0.05 * i as f64))
        .collect();

    let mut a = ForecastUnit::new(SENSOR, params.clone());
    let mut b = ForecastUnit::new(SENSOR, params);
    feed(&mut a, series.clone());
    feed(&mut b, series);

    assert_eq!(a.forecast(), b.forecast());
    assert_eq!(a.forecast_path(8), b.forecast_path(8));
}

#[test]
fn stale_event_leaves_state_untouched() {
    let params = ForecastParams {
        window_size: 5,
        ..holt(3)
    };
    let mut unit = ForecastUnit::new(SENSOR, params);
    feed(&mut unit, (0..10).map(linear));
    let before_model = unit.model().clone();
    let before = unit.forecast().expect("ready");

    let outcome = unit.ingest(&event(2, 99.0)).expect("ingest");
    assert!(matches!(
        outcome,
        IngestOutcome::Dropped(OrderingAnomaly::Stale { .. })
    ));
    assert!(!outcome.changed_state());
    assert_eq!(unit.model(), &before_model);
    assert_eq!(unit.window_len(), 5);
    assert_eq!(unit.forecast(), Ok(before));
    assert_eq!(unit.anomalies().stale, 1);
}

#[test]
fn late_event_inside_window_matches_in_order_feed() {
    let params = ForecastParams {
        window_size: 10,
        ..holt(5)
    };
    let mut ordered = ForecastUnit::new(SENSOR, params.clone());
    feed(&mut ordered, (0..30).map(linear));

    let mut shuffled = ForecastUnit::new(SENSOR, params);
    feed(&mut shuffled, (0..27).map(linear));
    feed(&mut shuffled, [linear(28), linear(29)]);
    let outcome = shuffled.ingest(&linear(27)).expect("ingest");
    assert!(matches!(
        outcome,
        IngestOutcome::Reordered(OrderingAnomaly::Late { .. })
    ));

    assert_eq!(shuffled.model(), ordered.model());
    assert_eq!(shuffled.window_len(), ordered.window_len());
    assert_eq!(shuffled.forecast(), ordered.forecast());
    assert_eq!(shuffled.anomalies().ordering(), 1);
}

#[test]
fn duplicate_timestamp_keeps_last_value() {
    let params = holt(5);
    let mut expected = ForecastUnit::new(SENSOR, params.clone());
    feed(&mut expected, (0..12).map(|i| if i == 8 { event(8, 21.5) } else { linear(i) }));

    let mut unit = ForecastUnit::new(SENSOR, params);
    feed(&mut unit, (0..12).map(linear));
    let outcome = unit.ingest(&event(8, 21.5)).expect("ingest");
    assert!(matches!(
        outcome,
        IngestOutcome::Replaced(OrderingAnomaly::Duplicate { .. })
    ));

    assert_eq!(unit.model(), expected.model());
    assert_eq!(unit.forecast(), expected.forecast());
}

#[test]
fn gap_beyond_max_gap_returns_to_warming() {
    let mut unit = ForecastUnit::new(SENSOR, holt(5));
    feed(&mut unit, (0..10).map(linear));
    assert_eq!(unit.state(), UnitState::Ready);

    let resumed = 9 + unit.params().max_gap.num_minutes() + 1;
    feed(&mut unit, [linear(resumed)]);
    assert_eq!(unit.state(), UnitState::Warming);
    assert_eq!(unit.forecast(), Err(NotReady::Warming));
    assert_eq!(unit.anomalies().gap_resets, 1);

    feed(&mut unit, (resumed + 1..resumed + 5).map(linear));
    assert_eq!(unit.state(), UnitState::Ready);
}

#[test]
fn backfill_then_live_equals_single_pass() {
    let mut single = ForecastUnit::new(SENSOR, holt(20));
    feed(&mut single, (0..40).map(linear));

    let mut handoff = ForecastUnit::new(SENSOR, holt(20));
    feed(&mut handoff, (0..25).map(linear));
    assert!(handoff.forecast().is_ok());
    feed(&mut handoff, (25..40).map(linear));

    assert_eq!(handoff.model(), single.model());
    assert_eq!(handoff.forecast(), single.forecast());
}

#[test]
fn out_of_range_forecast_is_suppressed() {
    let params = ForecastParams {
        max_valid: 25.0,
        ..holt(20)
    };
    let mut unit = ForecastUnit::new(SENSOR, params);
    feed(&mut unit, (0..50).map(linear));

    match unit.forecast() {
        Err(NotReady::Diverged(divergence)) => {
            assert!((divergence.value - 25.9).abs() < 1e-6);
            assert_eq!(divergence.max_valid, 25.0);
        }
        other => panic!("expected divergence, got {other:?}"),
    }
    assert!(unit.last_forecast().is_none());
    assert_eq!(unit.anomalies().divergences, 1);
}

#[test]
fn unrepresentable_target_time_is_suppressed() {
    let end = DateTime::<Utc>::MAX_UTC;
    let mut unit = ForecastUnit::new(SENSOR, holt(3));
    feed(
        &mut unit,
        (1..=5)
            .rev()
            .map(|back| SensorEvent::new(SENSOR, end - ChronoDuration::minutes(back), 20.0)),
    );

    assert_eq!(unit.state(), UnitState::Ready);
    assert!(matches!(unit.forecast(), Err(NotReady::Diverged(_))));
    assert_eq!(unit.anomalies().divergences, 1);

    let path = unit.forecast_path(3);
    assert_eq!(path.len(), 1);
    assert_eq!(path[0].timestamp, end);
}

#[test]
fn window_span_evicts_into_base_and_sets_the_stale_floor() {
    let params = ForecastParams {
        window_size: 100,
        window_span: Some(ChronoDuration::minutes(5)),
        ..holt(3)
    };
    let mut spanned = ForecastUnit::new(SENSOR, params);
    let mut unbounded = ForecastUnit::new(SENSOR, holt(3));
    feed(&mut spanned, (0..11).map(linear));
    feed(&mut unbounded, (0..11).map(linear));

    // Minutes 5..=10 remain; 0..=4 were folded into the base model.
    assert_eq!(spanned.window_len(), 6);
    assert_eq!(spanned.model(), unbounded.model());

    let outcome = spanned.ingest(&event(4, 99.0)).expect("ingest");
    match outcome {
        IngestOutcome::Dropped(OrderingAnomaly::Stale { floor, .. }) => {
            assert_eq!(floor, t0() + ChronoDuration::minutes(5));
        }
        other => panic!("expected stale drop, got {other:?}"),
    }
    assert_eq!(spanned.model(), unbounded.model());

    assert!(matches!(
        spanned.ingest(&event(7, 20.75)).expect("ingest"),
        IngestOutcome::Replaced(_)
    ));
    assert_eq!(spanned.window_len(), 6);
}

#[test]
fn non_finite_values_are_rejected() {
    let mut unit = ForecastUnit::new(SENSOR, holt(5));
    feed(&mut unit, (0..3).map(linear));
    assert_eq!(
        unit.ingest(&event(3, f64::NAN)).expect("ingest"),
        IngestOutcome::Invalid
    );
    assert_eq!(unit.window_len(), 3);
    assert_eq!(unit.anomalies().invalid, 1);
}

#[test]
fn forecast_path_steps_forward_with_bounds() {
    let mut unit = ForecastUnit::new(SENSOR, holt(20));
    assert!(unit.forecast_path(3).is_empty());
    feed(&mut unit, (0..50).map(linear));

    let path = unit.forecast_path(3);
    assert_eq!(path.len(), 3);
    for (k, point) in path.iter().enumerate() {
        let step = k as i64 + 1;
        assert_eq!(point.timestamp, t0() + ChronoDuration::minutes(49 + step));
        let expected = 24.9 + 0.1 * step as f64;
        assert!((point.value - expected).abs() < 1e-6, "step {step}: {}", point.value);
        assert!(point.lower_bound <= point.value && point.value <= point.upper_bound);
    }
}

#[test]
fn close_is_idempotent_and_final() {
    let mut unit = ForecastUnit::new(SENSOR, holt(5));
    feed(&mut unit, (0..10).map(linear));
    unit.close();
    unit.close();

    assert_eq!(unit.state(), UnitState::Closed);
    assert_eq!(unit.forecast(), Err(NotReady::Closed));
    assert_eq!(
        unit.ingest(&linear(10)),
        Err(IngestError::Closed {
            sensor_id: SENSOR.to_string()
        })
    );
}

#[test]
fn events_for_other_sensors_are_refused() {
    let mut unit = ForecastUnit::new(SENSOR, holt(5));
    let foreign = SensorEvent::new("S2", t0(), 20.0);
    assert_eq!(
        unit.ingest(&foreign),
        Err(IngestError::WrongSensor {
            expected: SENSOR.to_string(),
            got: "S2".to_string()
        })
    );
    assert_eq!(unit.state(), UnitState::Cold);
}
