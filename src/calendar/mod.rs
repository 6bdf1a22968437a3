//! 13-week cash calendar.
//!
//! Combines forecasted inflows with scheduled outflows under payment-run
//! policy. Bills on hold never enter the run; unscheduled bills shift
//! forward to the entity's next payment-run weekday; template outflows
//! gap-fill only where no actual bill covers the (week, category) cell.
//! Closing cash chains week over week from the snapshot's opening balance.

use crate::error::Result;
use crate::forecast::ForecastEngine;
use crate::models::{OutflowItem, RecurringFrequency};
use crate::store::Store;
use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Weeks in the planning horizon.
pub const HORIZON_WEEKS: usize = 13;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryOutflow {
    pub total: f64,
    pub committed: f64,
    pub discretionary: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarWeek {
    pub week_label: String,
    pub start_date: NaiveDate,
    pub opening_cash: f64,
    pub inflow_p50: f64,
    pub inflow_p25: f64,
    pub inflow_p75: f64,
    pub outflow_total: f64,
    pub outflow_committed: f64,
    pub outflow_details: BTreeMap<String, CategoryOutflow>,
    pub closing_cash: f64,
    pub is_critical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarSummary {
    pub opening_cash: f64,
    pub min_threshold: f64,
    pub min_projected: f64,
    pub total_inflow_4w: f64,
    pub total_outflow_4w: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CashCalendar {
    pub snapshot_id: i64,
    pub base_currency: String,
    pub summary: CalendarSummary,
    pub grid: Vec<CalendarWeek>,
    /// Amounts excluded for lack of an FX rate.
    pub unknown_amount: f64,
}

fn monday_of(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

/// Shift a date forward to the next occurrence of the payment-run weekday
/// (same day counts).
fn next_payment_run(date: NaiveDate, payment_run_day: u8) -> NaiveDate {
    let current = date.weekday().num_days_from_monday() as i64;
    let target = (payment_run_day % 7) as i64;
    let days_ahead = (target - current).rem_euclid(7);
    date + Duration::days(days_ahead)
}

pub struct CashCalendarBuilder {
    store: Arc<Store>,
}

impl CashCalendarBuilder {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Project recurring outflow templates into OutflowItems over the next
    /// horizon. Returns the number of items created.
    pub fn project_recurring_outflows(
        &self,
        entity_id: i64,
        snapshot_id: i64,
        as_of: NaiveDate,
    ) -> Result<usize> {
        let end = as_of + Duration::weeks(HORIZON_WEEKS as i64 + 1);
        let mut created = 0usize;

        for recurring in self.store.list_recurring_outflows(entity_id)? {
            let mut occurrences = Vec::new();
            match recurring.frequency {
                RecurringFrequency::Weekly { day_of_week } => {
                    let mut current = next_payment_run(as_of, day_of_week);
                    while current < end {
                        occurrences.push(current);
                        current += Duration::weeks(1);
                    }
                }
                RecurringFrequency::Monthly {
                    day_of_month,
                    is_last_day,
                } => {
                    let mut year = as_of.year();
                    let mut month = as_of.month();
                    loop {
                        let target = if is_last_day {
                            last_day_of_month(year, month)
                        } else {
                            clamp_day_of_month(year, month, day_of_month)
                        };
                        if target >= end {
                            break;
                        }
                        if target >= as_of {
                            occurrences.push(target);
                        }
                        month += 1;
                        if month > 12 {
                            month = 1;
                            year += 1;
                        }
                    }
                }
            }

            for date in occurrences {
                self.store.insert_outflow_item(&OutflowItem {
                    id: 0,
                    snapshot_id,
                    entity_id,
                    category: recurring.category.clone(),
                    description: recurring.description.clone(),
                    amount: recurring.amount,
                    currency: recurring.currency.clone(),
                    expected_date: date,
                    is_discretionary: recurring.is_discretionary,
                    source: "Calendar".to_string(),
                    status: "Planned".to_string(),
                })?;
                created += 1;
            }
        }
        debug!(entity_id, snapshot_id, created, "recurring outflows projected");
        Ok(created)
    }

    /// Precedence-aware outflow combiner:
    /// actual bills first, templates gap-fill, committed/discretionary split.
    fn outflow_summary(
        &self,
        snapshot_id: i64,
        base_currency: &str,
        payment_run_day: u8,
        as_of: NaiveDate,
    ) -> Result<(BTreeMap<NaiveDate, BTreeMap<String, CategoryOutflow>>, f64)> {
        let mut summary: BTreeMap<NaiveDate, BTreeMap<String, CategoryOutflow>> = BTreeMap::new();
        let mut actual_mask: std::collections::BTreeSet<(NaiveDate, String)> =
            std::collections::BTreeSet::new();
        let mut unknown_amount = 0.0;

        let add = |summary: &mut BTreeMap<NaiveDate, BTreeMap<String, CategoryOutflow>>,
                       week: NaiveDate,
                       category: &str,
                       amount: f64,
                       discretionary: bool| {
            let cell = summary
                .entry(week)
                .or_default()
                .entry(category.to_string())
                .or_default();
            cell.total += amount;
            if discretionary {
                cell.discretionary += amount;
            } else {
                cell.committed += amount;
            }
        };

        // Actual bills first. Held bills are excluded outright.
        for bill in self.store.list_vendor_bills(snapshot_id)? {
            if bill.hold_status || bill.payment_date.is_some() {
                continue;
            }
            let Some(rate) = self
                .store
                .get_fx_rate(snapshot_id, &bill.currency, base_currency)?
            else {
                unknown_amount += bill.amount.abs();
                continue;
            };
            let cash_out_date = match bill.scheduled_payment_date {
                Some(scheduled) => scheduled,
                None => {
                    let due = bill.due_date.unwrap_or(as_of);
                    let approved = bill.approval_date.unwrap_or(as_of);
                    let base = due.max(approved).max(as_of);
                    next_payment_run(base, payment_run_day)
                }
            };
            let week = monday_of(cash_out_date);
            let category = bill
                .category
                .clone()
                .unwrap_or_else(|| "General Vendor".to_string());
            add(
                &mut summary,
                week,
                &category,
                bill.amount.abs() * rate,
                bill.is_discretionary,
            );
            actual_mask.insert((week, category));
        }

        // Templates fill only the gaps actuals left open.
        for item in self.store.list_outflow_items(snapshot_id)? {
            let week = monday_of(item.expected_date);
            if actual_mask.contains(&(week, item.category.clone())) {
                continue;
            }
            let Some(rate) = self
                .store
                .get_fx_rate(snapshot_id, &item.currency, base_currency)?
            else {
                unknown_amount += item.amount.abs();
                continue;
            };
            add(
                &mut summary,
                week,
                &item.category,
                item.amount.abs() * rate,
                item.is_discretionary,
            );
        }

        Ok((summary, unknown_amount))
    }

    /// Build the 13-week grid.
    pub fn build(&self, snapshot_id: i64, as_of: NaiveDate) -> Result<CashCalendar> {
        let snapshot = self.store.get_snapshot(snapshot_id)?;
        let entity = self.store.get_entity(snapshot.entity_id)?;

        let forecast = ForecastEngine::new(self.store.clone());
        let inflows = forecast.weekly_aggregation(snapshot_id, as_of)?;
        let inflow_map: BTreeMap<NaiveDate, &crate::forecast::WeekBucket> =
            inflows.weeks.iter().map(|w| (w.start_date, w)).collect();

        let start = inflows
            .weeks
            .first()
            .map(|w| w.start_date)
            .unwrap_or_else(|| monday_of(as_of));

        let (outflow_map, unknown_outflows) = self.outflow_summary(
            snapshot_id,
            &entity.base_currency,
            entity.payment_run_day,
            as_of,
        )?;

        let mut grid = Vec::with_capacity(HORIZON_WEEKS);
        let mut current_cash = snapshot.opening_bank_balance;
        for i in 0..HORIZON_WEEKS {
            let w_start = start + Duration::weeks(i as i64);
            let inflow = inflow_map.get(&w_start);
            let outflows = outflow_map.get(&w_start).cloned().unwrap_or_default();

            let outflow_total: f64 = outflows.values().map(|c| c.total).sum();
            let outflow_committed: f64 = outflows.values().map(|c| c.committed).sum();
            let inflow_p50 = inflow.map(|w| w.base).unwrap_or(0.0);

            let closing_cash = current_cash + inflow_p50 - outflow_total;
            grid.push(CalendarWeek {
                week_label: format!("W{}", i + 1),
                start_date: w_start,
                opening_cash: current_cash,
                inflow_p50,
                inflow_p25: inflow.map(|w| w.upside).unwrap_or(0.0),
                inflow_p75: inflow.map(|w| w.downside).unwrap_or(0.0),
                outflow_total,
                outflow_committed,
                outflow_details: outflows,
                closing_cash,
                is_critical: closing_cash < snapshot.min_cash_threshold,
            });
            current_cash = closing_cash;
        }

        let summary = CalendarSummary {
            opening_cash: snapshot.opening_bank_balance,
            min_threshold: snapshot.min_cash_threshold,
            min_projected: grid
                .iter()
                .map(|w| w.closing_cash)
                .fold(f64::INFINITY, f64::min),
            total_inflow_4w: grid.iter().take(4).map(|w| w.inflow_p50).sum(),
            total_outflow_4w: grid.iter().take(4).map(|w| w.outflow_total).sum(),
        };

        Ok(CashCalendar {
            snapshot_id,
            base_currency: entity.base_currency,
            summary,
            grid,
            unknown_amount: inflows.unknown_amount + unknown_outflows,
        })
    }
}

fn last_day_of_month(year: i32, month: u32) -> NaiveDate {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1).unwrap() - Duration::days(1)
}

fn clamp_day_of_month(year: i32, month: u32, day: u8) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day as u32)
        .unwrap_or_else(|| last_day_of_month(year, month))
}
