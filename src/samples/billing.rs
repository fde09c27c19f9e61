//! Subscription billing samples.
//!
//! `Subscription` creates a subscription and takes the first charge.
//! `BillingCycle` runs a single billing period. `RecurringBilling` is the
//! long-running variant: it waits on a durable timer for the next billing date,
//! runs one cycle and continues as new with the date advanced by one calendar
//! month. The wait can be interrupted by the `reconfigure` and
//! `cancel_billing` signals or by cancelling the orchestration.
//!
//! Activities are deterministic stand-ins for a payment backend: ids derive
//! from their inputs and a payment method containing `declined` fails.

use std::time::Duration;

use chrono::{Months, NaiveDate, NaiveTime};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::runtime::registry::{ActivityRegistryBuilder, OrchestrationRegistryBuilder};
use crate::{
    ActivityContext, ActivityOptions, DurableOutput, OrchestrationContext, ProcessHandlers, RetryPolicy,
    decode_payload, durable_error, durable_info, durable_warn, encode_payload,
};

pub const SUBSCRIPTION: &str = "Subscription";
pub const BILLING_CYCLE: &str = "BillingCycle";
pub const RECURRING_BILLING: &str = "RecurringBilling";

pub const CREATE_SUBSCRIPTION: &str = "CreateSubscription";
pub const CALCULATE_CHARGES: &str = "CalculateCharges";
pub const GENERATE_INVOICE: &str = "GenerateInvoice";
pub const PROCESS_PAYMENT: &str = "ProcessPayment";
pub const SEND_INVOICE_EMAIL: &str = "SendInvoiceEmail";
pub const UPDATE_SUBSCRIPTION_STATUS: &str = "UpdateSubscriptionStatus";

pub const RECONFIGURE_SIGNAL: &str = "reconfigure";
pub const CANCEL_BILLING_SIGNAL: &str = "cancel_billing";
pub const NEXT_BILLING_DATE_QUERY: &str = "get_next_billing_date";

pub const PAYMENT_SUCCEEDED: &str = "succeeded";
pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_PAYMENT_FAILED: &str = "payment_failed";

/// Monthly price of a plan, if the plan exists.
pub fn plan_price(plan_id: &str) -> Option<f64> {
    match plan_id {
        "basic" => Some(19.99),
        "pro" => Some(49.99),
        "enterprise" => Some(199.99),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionParams {
    pub customer_id: String,
    pub plan_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionDetails {
    pub id: String,
    pub customer_id: String,
    pub plan_id: String,
    pub price_per_month: f64,
    pub status: String,
    pub payment_method_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceItem {
    pub description: String,
    pub amount: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceDetails {
    pub id: String,
    pub subscription_id: String,
    pub amount: f64,
    pub currency: String,
    pub status: String,
    pub items: Vec<InvoiceItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub id: String,
    pub invoice_id: String,
    pub amount: f64,
    pub currency: String,
    pub status: String,
    pub payment_method_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    pub subscription: SubscriptionDetails,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub invoice: InvoiceDetails,
    pub subscription: SubscriptionDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvoiceEmail {
    pub invoice: InvoiceDetails,
    pub customer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub subscription_id: String,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingCycleParams {
    pub subscription: SubscriptionDetails,
    pub billing_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingCycleResult {
    pub subscription_id: String,
    pub status: String,
    pub invoice_id: String,
    pub payment_id: String,
    pub amount: f64,
    pub next_billing_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringBillingParams {
    pub subscription: SubscriptionDetails,
    pub next_billing_date: NaiveDate,
    #[serde(default)]
    pub cycles_completed: u32,
    #[serde(default)]
    pub cycles_skipped: u32,
    /// Stop after this many billing periods; `None` bills forever.
    #[serde(default)]
    pub max_cycles: Option<u32>,
}

/// Payload of the `reconfigure` signal. Absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Reconfigure {
    pub plan_id: Option<String>,
    pub next_billing_date: Option<NaiveDate>,
    pub max_cycles: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringBillingSummary {
    pub subscription_id: String,
    pub status: String,
    pub cycles_completed: u32,
    pub cycles_skipped: u32,
}

fn add_month(date: NaiveDate) -> Result<NaiveDate, String> {
    date.checked_add_months(Months::new(1))
        .ok_or_else(|| format!("cannot advance billing date {date} by one month"))
}

/// Milliseconds since the epoch at the start of `date` (UTC).
fn date_to_ms(date: NaiveDate) -> u64 {
    u64::try_from(date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()).unwrap_or(0)
}

fn subscription_options() -> ActivityOptions {
    ActivityOptions::new()
        .with_start_to_close_timeout(Duration::from_secs(10))
        .with_retry(
            RetryPolicy::new(3)
                .with_initial_interval(Duration::from_secs(1))
                .with_backoff_coefficient(2.0)
                .with_maximum_interval(Duration::from_secs(60)),
        )
}

fn recurring_options() -> ActivityOptions {
    ActivityOptions::new()
        .with_start_to_close_timeout(Duration::from_secs(30))
        .with_heartbeat_timeout(Duration::from_secs(10))
        .with_retry(
            RetryPolicy::new(5)
                .with_initial_interval(Duration::from_secs(1))
                .with_backoff_coefficient(2.0)
                .with_maximum_interval(Duration::from_secs(60)),
        )
}

async fn call<In, Out>(
    ctx: &OrchestrationContext,
    name: &str,
    input: &In,
    options: &ActivityOptions,
) -> Result<Out, String>
where
    In: Serialize + Sync,
    Out: DeserializeOwned,
{
    let raw = ctx
        .schedule_activity_typed(name, input, options.clone())?
        .into_activity()
        .await?;
    decode_payload(&raw)
}

/// What one billing period produced before the best-effort stages.
struct Charge {
    invoice: InvoiceDetails,
    payment: PaymentDetails,
}

/// Charge, invoice and pay. Any failure here aborts the period.
async fn charge(
    ctx: &OrchestrationContext,
    subscription: &SubscriptionDetails,
    options: &ActivityOptions,
) -> Result<Charge, String> {
    let amount: f64 = call(ctx, CALCULATE_CHARGES, subscription, options).await?;
    let invoice: InvoiceDetails = call(
        ctx,
        GENERATE_INVOICE,
        &InvoiceRequest {
            subscription: subscription.clone(),
            amount,
        },
        options,
    )
    .await?;
    let payment: PaymentDetails = call(
        ctx,
        PROCESS_PAYMENT,
        &PaymentRequest {
            invoice: invoice.clone(),
            subscription: subscription.clone(),
        },
        options,
    )
    .await?;
    Ok(Charge { invoice, payment })
}

fn status_for(payment: &PaymentDetails) -> &'static str {
    if payment.status == PAYMENT_SUCCEEDED {
        STATUS_ACTIVE
    } else {
        STATUS_PAYMENT_FAILED
    }
}

async fn send_invoice_email(
    ctx: &OrchestrationContext,
    invoice: &InvoiceDetails,
    customer_id: &str,
    options: &ActivityOptions,
) {
    let email = InvoiceEmail {
        invoice: invoice.clone(),
        customer_id: customer_id.to_string(),
    };
    if let Err(e) = call::<_, String>(ctx, SEND_INVOICE_EMAIL, &email, options).await {
        durable_warn!(ctx, invoice_id = %invoice.id, error = %e, "invoice email failed, continuing");
    }
}

async fn update_status(
    ctx: &OrchestrationContext,
    subscription_id: &str,
    status: &str,
    options: &ActivityOptions,
) -> Result<(), String> {
    let update = StatusUpdate {
        subscription_id: subscription_id.to_string(),
        status: status.to_string(),
    };
    call::<_, String>(ctx, UPDATE_SUBSCRIPTION_STATUS, &update, options)
        .await
        .map(|_| ())
}

async fn subscription(ctx: OrchestrationContext, params: SubscriptionParams) -> Result<String, String> {
    durable_info!(ctx, customer_id = %params.customer_id, plan_id = %params.plan_id, "subscription started");
    let options = subscription_options();

    let details: SubscriptionDetails = call(&ctx, CREATE_SUBSCRIPTION, &params, &options).await?;
    let Charge { invoice, payment } = charge(&ctx, &details, &options).await.inspect_err(|e| {
        durable_error!(ctx, subscription_id = %details.id, error = %e, "first charge failed");
    })?;
    send_invoice_email(&ctx, &invoice, &details.customer_id, &options).await;

    let status = status_for(&payment);
    update_status(&ctx, &details.id, status, &options)
        .await
        .inspect_err(|e| durable_error!(ctx, subscription_id = %details.id, error = %e, "status update failed"))?;

    durable_info!(ctx, subscription_id = %details.id, status, "subscription completed");
    Ok(details.id)
}

async fn run_cycle(
    ctx: &OrchestrationContext,
    subscription: &SubscriptionDetails,
    billing_date: NaiveDate,
    options: &ActivityOptions,
) -> Result<BillingCycleResult, String> {
    let Charge { invoice, payment } = charge(ctx, subscription, options).await?;
    send_invoice_email(ctx, &invoice, &subscription.customer_id, options).await;

    let status = status_for(&payment);
    if let Err(e) = update_status(ctx, &subscription.id, status, options).await {
        durable_warn!(ctx, subscription_id = %subscription.id, error = %e, "status update failed, continuing");
    }

    Ok(BillingCycleResult {
        subscription_id: subscription.id.clone(),
        status: status.to_string(),
        invoice_id: invoice.id,
        payment_id: payment.id,
        amount: payment.amount,
        next_billing_date: add_month(billing_date)?,
    })
}

async fn billing_cycle(ctx: OrchestrationContext, params: BillingCycleParams) -> Result<BillingCycleResult, String> {
    let result = run_cycle(&ctx, &params.subscription, params.billing_date, &subscription_options()).await?;
    durable_info!(
        ctx,
        subscription_id = %result.subscription_id,
        status = %result.status,
        next_billing_date = %result.next_billing_date,
        "billing cycle completed"
    );
    Ok(result)
}

fn reconfigured(mut params: RecurringBillingParams, change: Reconfigure) -> Result<RecurringBillingParams, String> {
    if let Some(plan_id) = change.plan_id {
        let price = plan_price(&plan_id).ok_or_else(|| format!("unknown plan '{plan_id}'"))?;
        params.subscription.plan_id = plan_id;
        params.subscription.price_per_month = price;
    }
    if let Some(date) = change.next_billing_date {
        params.next_billing_date = date;
    }
    if change.max_cycles.is_some() {
        params.max_cycles = change.max_cycles;
    }
    Ok(params)
}

async fn recurring_billing(ctx: OrchestrationContext, input: String) -> Result<String, String> {
    let params: RecurringBillingParams = decode_payload(&input)?;
    ctx.install_handlers(
        params.next_billing_date,
        ProcessHandlers::new().query(NEXT_BILLING_DATE_QUERY, |date: &NaiveDate| encode_payload(date)),
    )?;
    durable_info!(
        ctx,
        subscription_id = %params.subscription.id,
        next_billing_date = %params.next_billing_date,
        cycles_completed = params.cycles_completed,
        "waiting for next billing cycle"
    );

    let wait_ms = date_to_ms(params.next_billing_date).saturating_sub(ctx.now_ms());
    let (idx, out) = ctx
        .select(vec![
            ctx.schedule_timer(Duration::from_millis(wait_ms)),
            ctx.schedule_signal(RECONFIGURE_SIGNAL),
            ctx.schedule_signal(CANCEL_BILLING_SIGNAL),
            ctx.schedule_cancellation(),
        ])
        .await;

    match (idx, out) {
        (0, _) => {}
        (1, DurableOutput::Signal(payload)) => {
            let next = decode_payload::<Reconfigure>(&payload).and_then(|c| reconfigured(params.clone(), c));
            let next = match next {
                Ok(next) => {
                    durable_info!(ctx, plan_id = %next.subscription.plan_id, "billing reconfigured");
                    next
                }
                Err(e) => {
                    durable_warn!(ctx, error = %e, "ignoring invalid reconfiguration");
                    params
                }
            };
            return ctx.continue_as_new_typed(&next)?.await;
        }
        (2, _) => {
            durable_info!(ctx, subscription_id = %params.subscription.id, "billing cancelled by signal");
            return encode_payload(&RecurringBillingSummary {
                subscription_id: params.subscription.id,
                status: "cancelled".to_string(),
                cycles_completed: params.cycles_completed,
                cycles_skipped: params.cycles_skipped,
            });
        }
        _ => return Err("recurring billing cancelled".to_string()),
    }

    let mut next = params.clone();
    match run_cycle(&ctx, &params.subscription, params.next_billing_date, &recurring_options()).await {
        Ok(result) => {
            durable_info!(
                ctx,
                subscription_id = %result.subscription_id,
                status = %result.status,
                invoice_id = %result.invoice_id,
                "billing cycle completed"
            );
            next.cycles_completed += 1;
        }
        Err(e) => {
            durable_warn!(ctx, subscription_id = %params.subscription.id, error = %e, "billing cycle skipped");
            next.cycles_skipped += 1;
        }
    }
    next.next_billing_date = add_month(params.next_billing_date)?;

    let periods = next.cycles_completed + next.cycles_skipped;
    if next.max_cycles.is_some_and(|max| periods >= max) {
        return encode_payload(&RecurringBillingSummary {
            subscription_id: next.subscription.id,
            status: "completed".to_string(),
            cycles_completed: next.cycles_completed,
            cycles_skipped: next.cycles_skipped,
        });
    }
    ctx.continue_as_new_typed(&next)?.await
}

pub fn register_orchestrations(builder: OrchestrationRegistryBuilder) -> OrchestrationRegistryBuilder {
    builder
        .register_typed(SUBSCRIPTION, subscription)
        .register_typed(BILLING_CYCLE, billing_cycle)
        .register(RECURRING_BILLING, recurring_billing)
}

async fn create_subscription(ctx: ActivityContext, params: SubscriptionParams) -> Result<SubscriptionDetails, String> {
    let price = plan_price(&params.plan_id).ok_or_else(|| format!("unknown plan '{}'", params.plan_id))?;
    tracing::info!(
        target: "duroflow::samples",
        instance_id = %ctx.instance_id(),
        customer_id = %params.customer_id,
        plan_id = %params.plan_id,
        "creating subscription"
    );
    Ok(SubscriptionDetails {
        id: format!("sub_{}", params.customer_id),
        payment_method_id: format!("pm_{}", params.customer_id),
        customer_id: params.customer_id,
        plan_id: params.plan_id,
        price_per_month: price,
        status: "pending".to_string(),
    })
}

async fn calculate_charges(_ctx: ActivityContext, subscription: SubscriptionDetails) -> Result<f64, String> {
    if subscription.price_per_month <= 0.0 {
        return Err(format!("subscription {} has no price", subscription.id));
    }
    Ok(subscription.price_per_month)
}

async fn generate_invoice(ctx: ActivityContext, req: InvoiceRequest) -> Result<InvoiceDetails, String> {
    let base = req.subscription.price_per_month;
    let mut items = vec![InvoiceItem {
        description: format!("Subscription to {}", req.subscription.plan_id),
        amount: base,
        quantity: 1,
    }];
    if req.amount > base {
        items.push(InvoiceItem {
            description: "Usage charges".to_string(),
            amount: req.amount - base,
            quantity: 1,
        });
    }
    Ok(InvoiceDetails {
        id: format!(
            "inv_{}_{}_{}",
            req.subscription.id,
            ctx.execution_id(),
            ctx.activity_id()
        ),
        subscription_id: req.subscription.id,
        amount: req.amount,
        currency: "USD".to_string(),
        status: "pending".to_string(),
        items,
    })
}

async fn process_payment(_ctx: ActivityContext, req: PaymentRequest) -> Result<PaymentDetails, String> {
    let status = if req.subscription.payment_method_id.contains("declined") {
        "failed"
    } else {
        PAYMENT_SUCCEEDED
    };
    Ok(PaymentDetails {
        id: format!("py_{}", req.invoice.id),
        invoice_id: req.invoice.id,
        amount: req.invoice.amount,
        currency: req.invoice.currency,
        status: status.to_string(),
        payment_method_id: req.subscription.payment_method_id,
    })
}

pub fn register_activities(builder: ActivityRegistryBuilder) -> ActivityRegistryBuilder {
    builder
        .register_typed(CREATE_SUBSCRIPTION, create_subscription)
        .register_typed(CALCULATE_CHARGES, calculate_charges)
        .register_typed(GENERATE_INVOICE, generate_invoice)
        .register_typed(PROCESS_PAYMENT, process_payment)
        .register_typed(SEND_INVOICE_EMAIL, |ctx: ActivityContext, email: InvoiceEmail| async move {
            tracing::info!(
                target: "duroflow::samples",
                instance_id = %ctx.instance_id(),
                invoice_id = %email.invoice.id,
                customer_id = %email.customer_id,
                "invoice email sent"
            );
            Ok("sent".to_string())
        })
        .register_typed(UPDATE_SUBSCRIPTION_STATUS, |ctx: ActivityContext, update: StatusUpdate| async move {
            tracing::info!(
                target: "duroflow::samples",
                instance_id = %ctx.instance_id(),
                subscription_id = %update.subscription_id,
                status = %update.status,
                "subscription status updated"
            );
            Ok(update.status)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_date_advances_one_calendar_month() {
        let jan31 = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert_eq!(add_month(jan31).unwrap(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        let dec15 = NaiveDate::from_ymd_opt(2024, 12, 15).unwrap();
        assert_eq!(add_month(dec15).unwrap(), NaiveDate::from_ymd_opt(2025, 1, 15).unwrap());
    }

    #[test]
    fn reconfigure_rejects_unknown_plan() {
        let params = RecurringBillingParams {
            subscription: SubscriptionDetails {
                id: "sub_1".into(),
                customer_id: "c1".into(),
                plan_id: "basic".into(),
                price_per_month: 19.99,
                status: STATUS_ACTIVE.into(),
                payment_method_id: "pm_1".into(),
            },
            next_billing_date: NaiveDate::from_ymd_opt(2025, 3, 1).unwrap(),
            cycles_completed: 0,
            cycles_skipped: 0,
            max_cycles: None,
        };
        let upgraded = reconfigured(
            params.clone(),
            Reconfigure {
                plan_id: Some("pro".into()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(upgraded.subscription.price_per_month, 49.99);
        assert!(
            reconfigured(
                params,
                Reconfigure {
                    plan_id: Some("platinum".into()),
                    ..Default::default()
                }
            )
            .is_err()
        );
    }

    #[test]
    fn epoch_millis_for_date() {
        assert_eq!(date_to_ms(NaiveDate::from_ymd_opt(1970, 1, 2).unwrap()), 86_400_000);
    }
}
