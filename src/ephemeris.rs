use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Fixed observer location for dawn/dusk computation.
#[derive(Debug, Clone, Copy)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    pub tz: Tz,
}

/// Civil dawn and dusk as local times-of-day for the given date.
///
/// Standard NOAA sunrise-equation computation with a solar depression of 6
/// degrees. Returns `None` inside polar day/night where the sun never
/// crosses the civil twilight boundary.
pub fn dawn_dusk(location: &Location, date: NaiveDate) -> Option<(NaiveTime, NaiveTime)> {
    // Days since the J2000 epoch, corrected for the mean solar time at the
    // observer's longitude.
    let julian_day = julian_day_number(date);
    let mean_solar_time = julian_day as f64 - 2_451_545.0 + 0.0008 - location.longitude / 360.0;

    let solar_mean_anomaly = (357.5291 + 0.985_600_28 * mean_solar_time).rem_euclid(360.0);
    let m_rad = solar_mean_anomaly.to_radians();
    let equation_of_center =
        1.9148 * m_rad.sin() + 0.02 * (2.0 * m_rad).sin() + 0.0003 * (3.0 * m_rad).sin();
    let ecliptic_longitude = (solar_mean_anomaly + equation_of_center + 180.0 + 102.9372).rem_euclid(360.0);
    let l_rad = ecliptic_longitude.to_radians();

    let solar_transit =
        2_451_545.0 + mean_solar_time + 0.0053 * m_rad.sin() - 0.0069 * (2.0 * l_rad).sin();

    let sin_declination = l_rad.sin() * 23.44_f64.to_radians().sin();
    let declination = sin_declination.asin();

    // -6 degrees: civil twilight.
    let lat_rad = location.latitude.to_radians();
    let cos_hour_angle = ((-6.0_f64).to_radians().sin() - lat_rad.sin() * declination.sin())
        / (lat_rad.cos() * declination.cos());
    if !(-1.0..=1.0).contains(&cos_hour_angle) {
        return None;
    }
    let hour_angle_deg = cos_hour_angle.acos().to_degrees();

    let dawn_jd = solar_transit - hour_angle_deg / 360.0;
    let dusk_jd = solar_transit + hour_angle_deg / 360.0;

    let dawn = julian_to_local(dawn_jd, location.tz)?;
    let dusk = julian_to_local(dusk_jd, location.tz)?;
    Some((dawn.time(), dusk.time()))
}

fn julian_day_number(date: NaiveDate) -> i64 {
    // Fliegel & Van Flandern, valid for all Gregorian dates.
    let (y, m, d) = (date.year() as i64, date.month() as i64, date.day() as i64);
    let a = (14 - m) / 12;
    let y2 = y + 4800 - a;
    let m2 = m + 12 * a - 3;
    d + (153 * m2 + 2) / 5 + 365 * y2 + y2 / 4 - y2 / 100 + y2 / 400 - 32045
}

fn julian_to_local(jd: f64, tz: Tz) -> Option<DateTime<Tz>> {
    let unix_secs = (jd - 2_440_587.5) * 86_400.0;
    let utc = DateTime::<Utc>::from_timestamp(unix_secs.round() as i64, 0)?;
    Some(utc.with_timezone(&tz))
}

/// The local calendar date at `instant`.
pub fn local_date(instant: DateTime<Utc>, tz: Tz) -> NaiveDate {
    instant.with_timezone(&tz).date_naive()
}

/// The UTC instant of local midnight beginning `date`.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    // During a DST gap the earliest valid instant after midnight is used.
    let naive = date.and_hms_opt(0, 0, 0).expect("valid midnight");
    match tz.from_local_datetime(&naive) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(first, _) => first.with_timezone(&Utc),
        chrono::LocalResult::None => {
            let later = naive + chrono::Duration::hours(1);
            tz.from_local_datetime(&later)
                .earliest()
                .map(|dt| dt.with_timezone(&Utc))
                .expect("post-gap midnight resolves")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sydney() -> Location {
        Location {
            latitude: -33.8688,
            longitude: 151.2093,
            tz: chrono_tz::Australia::Sydney,
        }
    }

    #[test]
    fn sydney_midwinter_dawn_dusk_are_plausible() {
        let date = NaiveDate::from_ymd_opt(2024, 6, 21).unwrap();
        let (dawn, dusk) = dawn_dusk(&sydney(), date).unwrap();
        // Civil dawn in Sydney around the solstice is roughly 06:30-07:00,
        // dusk roughly 17:15-17:45.
        assert!(dawn > NaiveTime::from_hms_opt(6, 0, 0).unwrap());
        assert!(dawn < NaiveTime::from_hms_opt(7, 15, 0).unwrap());
        assert!(dusk > NaiveTime::from_hms_opt(17, 0, 0).unwrap());
        assert!(dusk < NaiveTime::from_hms_opt(18, 0, 0).unwrap());
    }

    #[test]
    fn polar_night_yields_none() {
        let svalbard = Location {
            latitude: 78.22,
            longitude: 15.65,
            tz: chrono_tz::Arctic::Longyearbyen,
        };
        let date = NaiveDate::from_ymd_opt(2024, 12, 21).unwrap();
        assert!(dawn_dusk(&svalbard, date).is_none());
    }

    #[test]
    fn local_midnight_handles_dst_spring_forward() {
        // Sydney DST starts 2024-10-06: 02:00 jumps to 03:00. Midnight
        // itself exists, so this is the plain path.
        let date = NaiveDate::from_ymd_opt(2024, 10, 6).unwrap();
        let midnight = local_midnight(date, chrono_tz::Australia::Sydney);
        assert_eq!(local_date(midnight, chrono_tz::Australia::Sydney), date);
    }
}
