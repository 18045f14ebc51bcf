use chrono::{DateTime, Datelike, Duration, Month, Utc};
use chrono_tz::Tz;
use tracing::info;

use crate::config::OutputConfig;
use crate::domain::{DayRecord, OutputState};
use crate::ephemeris;

/// Live readings folded into the ledger each tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickReadings {
    pub is_on: bool,
    pub power_w: f64,
    pub price_c_per_kwh: f64,
}

/// Advance an output's daily accounting by one tick.
///
/// ON-seconds accumulate monotonically within the local calendar day. At
/// local midnight the finished day is pushed onto the history ring and the
/// shortfall carried forward:
///
///   newShortfall = clamp(target - actual + oldShortfall, 0, maxShortfall)
///
/// Outputs with target_hours == -1 never carry shortfall. Returns true when
/// the day rolled over, which invalidates the current run plan.
pub fn tick(
    state: &mut OutputState,
    cfg: &OutputConfig,
    now: DateTime<Utc>,
    tz: Tz,
    elapsed: Duration,
    readings: TickReadings,
) -> bool {
    let today = ephemeris::local_date(now, tz);
    let rolled = today != state.accounting_date;

    if rolled {
        close_day(state, cfg);
        state.accounting_date = today;
    }

    if readings.is_on && elapsed > Duration::zero() {
        let hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
        state.on_seconds_today += elapsed.num_seconds().max(0) as u64;
        if readings.power_w > 0.0 {
            let energy_wh = readings.power_w * hours;
            state.energy_wh_today += energy_wh;
            state.cost_cents_today += (energy_wh / 1000.0) * readings.price_c_per_kwh;
        }
    }

    rolled
}

fn close_day(state: &mut OutputState, cfg: &OutputConfig) {
    let actual_hours = state.on_seconds_today as f64 / 3600.0;
    state.days.push_back(DayRecord {
        date: state.accounting_date,
        on_seconds: state.on_seconds_today,
        energy_wh: state.energy_wh_today,
        cost_cents: state.cost_cents_today,
    });

    let month = Month::try_from(state.accounting_date.month() as u8).expect("valid month");
    state.shortfall_hours = match cfg.target_hours_for(month) {
        Some(target) => (target - actual_hours + state.shortfall_hours)
            .clamp(0.0, cfg.max_shortfall_hours),
        None => 0.0,
    };

    info!(
        output = %cfg.name,
        date = %state.accounting_date,
        actual_hours = format!("{actual_hours:.2}"),
        shortfall = format!("{:.2}", state.shortfall_hours),
        "day closed"
    );

    state.on_seconds_today = 0;
    state.energy_wh_today = 0.0;
    state.cost_cents_today = 0.0;
}

/// Average draw in Wh per ON-hour over the history ring plus today, used to
/// forecast run cost. Zero when the output has never metered anything.
pub fn hourly_energy_wh(state: &OutputState) -> f64 {
    let mut energy = state.energy_wh_today;
    let mut seconds = state.on_seconds_today;
    for day in &state.days {
        energy += day.energy_wh;
        seconds += day.on_seconds;
    }
    if seconds == 0 {
        return 0.0;
    }
    energy / (seconds as f64 / 3600.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Channel, InputMode, OutputKind, RunMode};
    use chrono::{NaiveDate, TimeZone};

    fn tz() -> Tz {
        chrono_tz::Australia::Sydney
    }

    fn cfg(target: f64, max_shortfall: f64) -> OutputConfig {
        OutputConfig {
            name: "Pump".to_string(),
            kind: OutputKind::Switched,
            mode: RunMode::BestPrice,
            relay: Some("Pump Relay".to_string()),
            meter: None,
            input: None,
            input_mode: InputMode::Ignore,
            schedule: None,
            constraint_schedule: None,
            channel: Channel::General,
            min_hours: 0.0,
            target_hours: target,
            max_hours: 24.0,
            monthly_target_hours: Default::default(),
            max_shortfall_hours: max_shortfall,
            max_best_price: 25.0,
            max_priority_price: 35.0,
            min_on_minutes: 0,
            min_off_minutes: None,
            max_off_minutes: None,
            dates_off: Vec::new(),
            stop_on_exit: false,
            parent: None,
            turn_on_sequence: None,
            turn_off_sequence: None,
            max_app_on_minutes: 0,
            max_app_off_minutes: 0,
            temp_constraints: Vec::new(),
            ups: None,
            power_on_threshold_w: 100.0,
            power_off_threshold_w: 20.0,
            min_energy_to_log_wh: 0.0,
        }
    }

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        tz().with_ymd_and_hms(y, mo, d, h, mi, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn on_seconds_accumulate_monotonically() {
        let cfg = cfg(4.0, 0.0);
        let mut state = OutputState::new(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());

        let mut last = 0;
        for minute in 0..10 {
            let now = at(2024, 6, 3, 10, minute);
            tick(
                &mut state,
                &cfg,
                now,
                tz(),
                Duration::seconds(60),
                TickReadings {
                    is_on: true,
                    power_w: 1200.0,
                    price_c_per_kwh: 20.0,
                },
            );
            assert!(state.on_seconds_today >= last);
            last = state.on_seconds_today;
        }
        assert_eq!(state.on_seconds_today, 600);
        assert!(state.energy_wh_today > 0.0);
    }

    #[test]
    fn midnight_rollover_resets_and_carries_shortfall() {
        let cfg = cfg(4.0, 6.0);
        let mut state = OutputState::new(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        state.on_seconds_today = 3600; // ran 1 of 4 target hours

        let rolled = tick(
            &mut state,
            &cfg,
            at(2024, 6, 4, 0, 0),
            tz(),
            Duration::seconds(30),
            TickReadings::default(),
        );

        assert!(rolled);
        assert_eq!(state.accounting_date, NaiveDate::from_ymd_opt(2024, 6, 4).unwrap());
        assert_eq!(state.on_seconds_today, 0);
        assert!((state.shortfall_hours - 3.0).abs() < 1e-9);
        assert_eq!(state.days.len(), 1);
        assert_eq!(state.days[0].on_seconds, 3600);
    }

    #[test]
    fn shortfall_is_bounded_by_max_shortfall() {
        let cfg = cfg(8.0, 2.0);
        let mut state = OutputState::new(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        state.shortfall_hours = 2.0; // already at the cap, ran nothing today

        tick(
            &mut state,
            &cfg,
            at(2024, 6, 4, 0, 0),
            tz(),
            Duration::seconds(30),
            TickReadings::default(),
        );

        assert!((state.shortfall_hours - 2.0).abs() < 1e-9);
    }

    #[test]
    fn all_hours_outputs_never_carry_shortfall() {
        let cfg = cfg(-1.0, 10.0);
        let mut state = OutputState::new(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        state.shortfall_hours = 5.0;

        tick(
            &mut state,
            &cfg,
            at(2024, 6, 4, 0, 0),
            tz(),
            Duration::seconds(30),
            TickReadings::default(),
        );

        assert_eq!(state.shortfall_hours, 0.0);
    }

    #[test]
    fn hourly_energy_averages_over_history() {
        let mut state = OutputState::new(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        state.days.push_back(DayRecord {
            date: NaiveDate::from_ymd_opt(2024, 6, 2).unwrap(),
            on_seconds: 7200,
            energy_wh: 3000.0,
            cost_cents: 60.0,
        });
        state.on_seconds_today = 3600;
        state.energy_wh_today = 1500.0;

        // 4500 Wh over 3 hours.
        assert!((hourly_energy_wh(&state) - 1500.0).abs() < 1e-9);
    }

    #[test]
    fn no_metering_yields_zero_estimate() {
        let state = OutputState::new(NaiveDate::from_ymd_opt(2024, 6, 3).unwrap());
        assert_eq!(hourly_energy_wh(&state), 0.0);
    }
}
