//! Daily sales against target for a store and its salespeople.
//!
//! Sales are loaded in batches through the day, so figures are always those
//! of the latest sale date loaded for the store, which may lag the calendar.

use std::{collections::HashMap, time::Duration as StdDuration};

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Timelike, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    model::Store,
    table::{decode, decode_all, Direction, Query, TableStore},
    DataAccessError,
};

const DAILY_STORE_SALES: &str = "daily_store_sales";
const DAILY_STORE_TARGETS: &str = "daily_store_targets";
const DAILY_SALESMAN_SALES: &str = "daily_salesman_sales";
const DAILY_SALESMAN_TARGETS: &str = "daily_salesman_targets";
const DAILY_SALES_META: &str = "daily_sales_meta";

/// India Standard Time, UTC+05:30.
const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

const REFRESH_BUFFER_MS: i64 = 30_000;
const MIN_REFRESH_MS: i64 = 500;

/// Achievement as a rounded percentage of target; `0` without a positive
/// target.
pub fn safe_percent(achieved: f64, target: f64) -> i64 {
    if !(target > 0.0) {
        return 0;
    }
    (achieved / target * 100.0).round() as i64
}

/// Limits a percentage to `0..=100` for progress bars.
pub fn clamp_percent(percent: i64) -> i64 {
    percent.clamp(0, 100)
}

/// How a percentage of target reads at a glance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PercentBand {
    /// At or above target.
    OnTrack,
    /// Within 80% of target.
    Close,
    /// Under 80% of target.
    Behind,
}

impl PercentBand {
    /// The band a percentage falls in.
    pub fn of(percent: i64) -> Self {
        match percent {
            p if p >= 100 => PercentBand::OnTrack,
            p if p >= 80 => PercentBand::Close,
            _ => PercentBand::Behind,
        }
    }
}

/// Time to wait before reloading sales: until the next :20 or :50 past the
/// hour, local to `now`, plus a 30 second buffer for the load to land. Never
/// less than half a second.
pub fn next_refresh_delay<Tz: TimeZone>(now: &DateTime<Tz>) -> StdDuration {
    let minute = i64::from(now.minute());
    let elapsed_in_minute =
        i64::from(now.second()) * 1000 + i64::from(now.nanosecond() / 1_000_000 % 1000);
    let into_hour = minute * 60_000 + elapsed_in_minute;

    let next_minute = if minute < 20 || (minute == 20 && elapsed_in_minute < REFRESH_BUFFER_MS) {
        20
    } else if minute < 50 || (minute == 50 && elapsed_in_minute < REFRESH_BUFFER_MS) {
        50
    } else {
        60 + 20
    };

    let wait = next_minute * 60_000 + REFRESH_BUFFER_MS - into_hour;
    StdDuration::from_millis(wait.max(MIN_REFRESH_MS).unsigned_abs())
}

/// Renders a `HH:MM[:SS]` time of day as `hh:mm AM/PM`.
fn twelve_hour(time: &str) -> Option<String> {
    let mut parts = time.split(':');
    let hour: u32 = parts.next()?.trim().parse().ok()?;
    let minute: u32 = parts.next().unwrap_or("0").trim().parse().ok()?;

    let meridiem = if hour % 24 >= 12 { "PM" } else { "AM" };
    let hour = (hour + 11) % 12 + 1;
    Some(format!("{hour:02}:{minute:02} {meridiem}"))
}

/// Renders an instant as an `hh:mm AM/PM` time in IST.
fn ist_time(instant: DateTime<Utc>) -> Option<String> {
    let ist = FixedOffset::east_opt(IST_OFFSET_SECS)?;
    Some(instant.with_timezone(&ist).format("%I:%M %p").to_string())
}

fn amount(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or_default(),
        Value::String(s) => s.trim().parse().unwrap_or_default(),
        _ => 0.0,
    }
}

fn key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

#[derive(Debug, Deserialize)]
struct SaleDateRow {
    sale_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
struct NetSalesRow {
    #[serde(default)]
    net_sales: Value,
}

#[derive(Debug, Deserialize)]
struct TargetRow {
    #[serde(default)]
    salesman_no: Value,
    #[serde(default)]
    target_amount: Value,
}

#[derive(Debug, Deserialize)]
struct SalesTillRow {
    #[serde(default)]
    sales_till: Option<String>,
    #[serde(default)]
    sales_till_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct SalesmanRow {
    salesman_no: Value,
    #[serde(default)]
    salesman_name: Option<String>,
    #[serde(default)]
    net_sales: Value,
    #[serde(default)]
    qty: Value,
    #[serde(default)]
    bill_count: Value,
}

/// A store's sales against target on its latest sale date.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SalesSummary {
    /// `None` when no sales have been loaded for the store.
    pub sale_date: Option<NaiveDate>,
    /// Net sales on that date.
    pub achieved: f64,
    /// The store's target for that date, `0` when none was set.
    pub target: f64,
}

impl SalesSummary {
    /// Achieved as a rounded percentage of target.
    pub fn percent(&self) -> i64 {
        safe_percent(self.achieved, self.target)
    }
}

/// One salesperson's day.
#[derive(Debug, Clone, PartialEq)]
pub struct SalespersonSales {
    /// Staff number.
    pub salesman_no: String,
    /// Display name.
    pub salesman_name: String,
    /// Net sales value.
    pub net_sales: f64,
    /// Units sold.
    pub qty: f64,
    /// Number of bills raised.
    pub bill_count: f64,
    /// `0` when no target was set.
    pub target: f64,
}

impl SalespersonSales {
    /// Net sales as a rounded percentage of target.
    pub fn percent(&self) -> i64 {
        safe_percent(self.net_sales, self.target)
    }
}

/// Everything the performance screen shows for a store.
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceReport {
    /// The store's code, as keyed in the sales tables.
    pub store_code: String,
    /// The store's name.
    pub store_name: String,
    /// Store-level totals.
    pub summary: SalesSummary,
    /// How far into the day the loaded sales reach, e.g. `09:05 PM`.
    pub sales_till: Option<String>,
    /// Highest sales first.
    pub salespeople: Vec<SalespersonSales>,
}

/// Reads daily sales and targets.
#[derive(Debug, Clone)]
pub struct PerformanceService<Tables: TableStore> {
    tables: Tables,
}

impl<Tables: TableStore> PerformanceService<Tables> {
    /// Creates a service over `tables`.
    pub fn new(tables: Tables) -> Self {
        Self { tables }
    }

    /// The most recent date with sales loaded for the store.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn latest_sale_date(
        &self,
        store_code: &str,
    ) -> Result<Option<NaiveDate>, DataAccessError> {
        let query = Query::table(DAILY_STORE_SALES)
            .eq("store_code", store_code)
            .order_by("sale_date", Direction::Descending);
        let latest = self.tables.query_row(&query).await?;
        Ok(latest
            .map(decode::<SaleDateRow>)
            .transpose()?
            .map(|row| row.sale_date))
    }

    /// How far into `sale_date` the loaded sales reach, as `hh:mm AM/PM` IST.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn sales_till_label(
        &self,
        sale_date: NaiveDate,
    ) -> Result<Option<String>, DataAccessError> {
        let query = Query::table(DAILY_SALES_META).eq("sale_date", sale_date.to_string());
        let Some(meta) = self.tables.query_row(&query).await? else {
            return Ok(None);
        };
        let meta: SalesTillRow = decode(meta)?;

        Ok(meta
            .sales_till
            .as_deref()
            .filter(|time| !time.is_empty())
            .and_then(twelve_hour)
            .or_else(|| meta.sales_till_ts.and_then(ist_time)))
    }

    /// The store's sales against target on its latest sale date.
    #[tracing::instrument(level = "debug", skip(self), err)]
    pub async fn summary(&self, store_code: &str) -> Result<SalesSummary, DataAccessError> {
        match self.latest_sale_date(store_code).await? {
            Some(sale_date) => self.summary_for(store_code, sale_date).await,
            None => Ok(SalesSummary::default()),
        }
    }

    /// The store's summary with a per-salesperson breakdown.
    ///
    /// Missing or unreadable targets count as zero.
    #[tracing::instrument(level = "debug", skip_all, fields(store.code = %store.code), err)]
    pub async fn report(&self, store: &Store) -> Result<PerformanceReport, DataAccessError> {
        let mut report = PerformanceReport {
            store_code: store.code.clone(),
            store_name: store.name.clone(),
            summary: SalesSummary::default(),
            sales_till: None,
            salespeople: Vec::new(),
        };

        let Some(sale_date) = self.latest_sale_date(&store.code).await? else {
            return Ok(report);
        };

        report.sales_till = match self.sales_till_label(sale_date).await {
            Ok(label) => label,
            Err(err) => {
                tracing::warn!(error = %err, "sales till time unavailable");
                None
            }
        };
        report.summary = self.summary_for(&store.code, sale_date).await?;

        let query = Query::table(DAILY_SALESMAN_SALES)
            .eq("sale_date", sale_date.to_string())
            .eq("store_code", store.code.as_str())
            .order_by("net_sales", Direction::Descending);
        let sales: Vec<SalesmanRow> = decode_all(self.tables.query_rows(&query).await?)?;

        let targets = self.salesman_targets(&store.code, sale_date).await;
        report.salespeople = sales
            .into_iter()
            .map(|row| {
                let salesman_no = key(&row.salesman_no);
                SalespersonSales {
                    target: targets.get(&salesman_no).copied().unwrap_or_default(),
                    salesman_name: row.salesman_name.unwrap_or_default(),
                    net_sales: amount(&row.net_sales),
                    qty: amount(&row.qty),
                    bill_count: amount(&row.bill_count),
                    salesman_no,
                }
            })
            .collect();

        Ok(report)
    }

    async fn summary_for(
        &self,
        store_code: &str,
        sale_date: NaiveDate,
    ) -> Result<SalesSummary, DataAccessError> {
        let query = Query::table(DAILY_STORE_SALES)
            .eq("sale_date", sale_date.to_string())
            .eq("store_code", store_code);
        let achieved: f64 = decode_all::<NetSalesRow>(self.tables.query_rows(&query).await?)?
            .iter()
            .map(|row| amount(&row.net_sales))
            .sum();

        Ok(SalesSummary {
            sale_date: Some(sale_date),
            achieved,
            target: self.store_target(store_code, sale_date).await,
        })
    }

    async fn store_target(&self, store_code: &str, sale_date: NaiveDate) -> f64 {
        let query = Query::table(DAILY_STORE_TARGETS)
            .eq("target_date", sale_date.to_string())
            .eq("store_code", store_code);

        let target = match self.tables.query_row(&query).await {
            Ok(row) => row.map(decode::<TargetRow>).transpose(),
            Err(err) => Err(err),
        };

        match target {
            Ok(target) => target.map_or(0.0, |row| amount(&row.target_amount)),
            Err(err) => {
                tracing::warn!(error = %err, "store target unavailable");
                0.0
            }
        }
    }

    async fn salesman_targets(&self, store_code: &str, sale_date: NaiveDate) -> HashMap<String, f64> {
        let query = Query::table(DAILY_SALESMAN_TARGETS)
            .eq("target_date", sale_date.to_string())
            .eq("store_code", store_code);

        match self
            .tables
            .query_rows(&query)
            .await
            .and_then(decode_all::<TargetRow>)
        {
            Ok(rows) => rows
                .iter()
                .map(|row| (key(&row.salesman_no), amount(&row.target_amount)))
                .collect(),
            Err(err) => {
                tracing::warn!(error = %err, "salesperson targets unavailable");
                HashMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;
    use crate::{table::row, MemoryStore};

    #[test]
    fn percent_helpers() {
        assert_eq!(safe_percent(50.0, 0.0), 0);
        assert_eq!(safe_percent(50.0, -10.0), 0);
        assert_eq!(safe_percent(50.0, f64::NAN), 0);
        assert_eq!(safe_percent(2.0, 3.0), 67);
        assert_eq!(safe_percent(150.0, 100.0), 150);

        assert_eq!(clamp_percent(150), 100);
        assert_eq!(clamp_percent(-3), 0);
        assert_eq!(clamp_percent(42), 42);

        assert_eq!(PercentBand::of(100), PercentBand::OnTrack);
        assert_eq!(PercentBand::of(80), PercentBand::Close);
        assert_eq!(PercentBand::of(79), PercentBand::Behind);
    }

    #[test]
    fn time_labels() {
        assert_eq!(twelve_hour("21:05:00").as_deref(), Some("09:05 PM"));
        assert_eq!(twelve_hour("00:30").as_deref(), Some("12:30 AM"));
        assert_eq!(twelve_hour("12:00").as_deref(), Some("12:00 PM"));
        assert_eq!(twelve_hour("soon"), None);

        let instant = Utc.with_ymd_and_hms(2024, 5, 10, 15, 35, 0).unwrap();
        assert_eq!(ist_time(instant).as_deref(), Some("09:05 PM"));
    }

    #[test]
    fn refresh_delays() {
        let ist = FixedOffset::east_opt(IST_OFFSET_SECS).unwrap();
        let at = |h, m, s| ist.with_ymd_and_hms(2024, 5, 10, h, m, s).unwrap();

        // 10:05:00 waits until 10:20:30.
        assert_eq!(next_refresh_delay(&at(10, 5, 0)), StdDuration::from_secs(15 * 60 + 30));
        // Still inside the :20 buffer.
        assert_eq!(next_refresh_delay(&at(10, 20, 10)), StdDuration::from_secs(20));
        // Past the :20 buffer waits for :50:30.
        assert_eq!(next_refresh_delay(&at(10, 20, 31)), StdDuration::from_secs(29 * 60 + 59));
        // After :50:30 waits for the next hour's :20:30.
        assert_eq!(next_refresh_delay(&at(10, 55, 0)), StdDuration::from_secs(25 * 60 + 30));
        // Never under half a second.
        assert_eq!(
            next_refresh_delay(&(at(10, 20, 29) + Duration::milliseconds(800))),
            StdDuration::from_millis(500)
        );
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .seed(
                DAILY_STORE_SALES,
                [
                    row(json!({ "store_code": "BLR01", "sale_date": "2024-05-09", "net_sales": 1000 })),
                    row(json!({ "store_code": "BLR01", "sale_date": "2024-05-10", "net_sales": 600.5 })),
                    row(json!({ "store_code": "BLR01", "sale_date": "2024-05-10", "net_sales": "199.5" })),
                    row(json!({ "store_code": "MUM01", "sale_date": "2024-05-11", "net_sales": 50 })),
                ],
            )
            .await;
        store
            .seed(
                DAILY_STORE_TARGETS,
                [
                    row(json!({ "store_code": "BLR01", "target_date": "2024-05-10", "target_amount": 1000 })),
                ],
            )
            .await;
        store
            .seed(
                DAILY_SALES_META,
                [
                    row(json!({ "sale_date": "2024-05-10", "sales_till": null, "sales_till_ts": "2024-05-10T15:35:00Z" })),
                ],
            )
            .await;
        store
            .seed(
                DAILY_SALESMAN_SALES,
                [
                    row(json!({ "store_code": "BLR01", "sale_date": "2024-05-10", "salesman_no": 7, "salesman_name": "Ravi", "net_sales": 300, "qty": 4, "bill_count": 2 })),
                    row(json!({ "store_code": "BLR01", "sale_date": "2024-05-10", "salesman_no": "12", "salesman_name": "Divya", "net_sales": 500, "qty": 6, "bill_count": 3 })),
                ],
            )
            .await;
        store
            .seed(
                DAILY_SALESMAN_TARGETS,
                [
                    row(json!({ "store_code": "BLR01", "target_date": "2024-05-10", "salesman_no": "7", "target_amount": 400 })),
                ],
            )
            .await;
        store
    }

    fn blr() -> Store {
        Store {
            id: "s-1".to_string(),
            code: "BLR01".to_string(),
            name: "Bengaluru Central".to_string(),
            region: None,
        }
    }

    #[tokio::test]
    async fn test_summary_uses_latest_date() {
        let service = PerformanceService::new(seeded().await);

        let summary = service.summary("BLR01").await.unwrap();
        assert_eq!(summary.sale_date, NaiveDate::from_ymd_opt(2024, 5, 10));
        assert_eq!(summary.achieved, 800.0);
        assert_eq!(summary.target, 1000.0);
        assert_eq!(summary.percent(), 80);

        // No target row for this store.
        let summary = service.summary("MUM01").await.unwrap();
        assert_eq!(summary.target, 0.0);
        assert_eq!(summary.percent(), 0);

        assert_eq!(service.summary("NONE").await.unwrap(), SalesSummary::default());
    }

    #[tokio::test]
    async fn test_report_joins_salesperson_targets() {
        let service = PerformanceService::new(seeded().await);

        let report = service.report(&blr()).await.unwrap();
        assert_eq!(report.store_name, "Bengaluru Central");
        assert_eq!(report.sales_till.as_deref(), Some("09:05 PM"));
        assert_eq!(report.summary.achieved, 800.0);

        let names: Vec<&str> = report
            .salespeople
            .iter()
            .map(|s| s.salesman_name.as_str())
            .collect();
        assert_eq!(names, vec!["Divya", "Ravi"]);
        assert_eq!(report.salespeople[0].target, 0.0);
        assert_eq!(report.salespeople[1].salesman_no, "7");
        assert_eq!(report.salespeople[1].target, 400.0);
        assert_eq!(report.salespeople[1].percent(), 75);
    }
}
