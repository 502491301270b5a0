// Whole-cycle tests: generation, idempotency and isolation between contracts

use chrono::NaiveTime;
use mail_parser::{MessageParser, MimeHeaders};
use rust_decimal::Decimal;
use std::sync::Arc;
use tally_shared::{DeliveryOutcome, DeliveryStatus, InvoiceStatus, PeriodWindow};
use tokio_util::sync::CancellationToken;

use crate::config::BillingConfig;
use crate::database::{PoolConfig, TenantPools};
use crate::error::BillingError;
use crate::jobs::{ContractOutcome, DailyTrigger, JobScheduler, JobStatus, RecurringBillingJob};
use crate::services::DeliveryService;
use crate::tests::fixtures::*;
use crate::tests::helpers::*;
use crate::tests::TestContext;

fn march() -> PeriodWindow {
    PeriodWindow::new(date(2024, 3, 1), date(2024, 4, 1)).unwrap()
}

fn outcome_for(
    result: &crate::jobs::BillingJobResult,
    contract_id: uuid::Uuid,
) -> &ContractOutcome {
    &result
        .contracts
        .iter()
        .find(|report| report.contract_id == contract_id)
        .expect("contract was checked")
        .outcome
}

#[tokio::test]
async fn test_hourly_contract_bills_exact_hours() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    let contract = ContractFixture::hourly(seed.client.id, "50.00", "USD");
    insert_contract_fixture(store.pool(), &contract).await;
    for entry in [
        TimeEntryFixture::lasting(contract.id, at(2024, 3, 4, 9), 120),
        TimeEntryFixture::lasting(contract.id, at(2024, 3, 5, 13), 90),
    ] {
        insert_time_entry_fixture(store.pool(), &entry).await;
    }

    let (transport, sent) = recording_transport();
    let job = ctx.billing_job(transport, pdf_renderer());
    let result = job.run(at(2024, 4, 1, 9), &CancellationToken::new()).await.unwrap();

    assert_eq!(result.tenants_processed, 1);
    assert_eq!(result.invoices_generated, 1);
    assert_eq!(result.invoices_delivered, 1);
    assert!(result.errors.is_empty());
    assert_eq!(result.total_amount_invoiced.get("USD"), Some(&Decimal::new(17500, 2)));

    let invoices = store.invoices_for_contract(contract.id).await.unwrap();
    assert_eq!(invoices.len(), 1);
    let invoice = &invoices[0];
    assert_eq!(invoice.display_number(), "INV-000001");
    assert_eq!(invoice.period, Some(march()));
    assert_eq!(invoice.line_items.len(), 1);
    assert_eq!(invoice.line_items[0].quantity, Decimal::new(35, 1));
    assert_eq!(invoice.total(), Decimal::new(17500, 2));
    assert_eq!(invoice.issue_date, date(2024, 4, 1));
    assert_eq!(invoice.due_date, date(2024, 5, 1));
    assert_eq!(invoice.status, InvoiceStatus::Sent);
    assert_eq!(invoice.delivery_status, DeliveryStatus::Delivered);

    let path = invoice.document_path.as_deref().expect("document stored");
    assert!(path.ends_with("acme/INV-000001.pdf"));
    assert_eq!(tokio::fs::read(path).await.unwrap(), FAKE_PDF);

    let attempts = store.delivery_attempts(invoice.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, DeliveryOutcome::Success);
    assert_eq!(Some(&attempts[0].recipient), seed.client.email.as_ref());

    let unbilled: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM time_entries WHERE invoice_id IS NULL")
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(unbilled, 0);

    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let parsed = MessageParser::default().parse(&sent[0][..]).unwrap();
    assert_eq!(
        parsed.subject(),
        Some(format!("Invoice INV-000001 from {}", seed.company.name).as_str())
    );
    let attachment = parsed.attachment(0).unwrap();
    assert_eq!(attachment.attachment_name(), Some("INV-000001.pdf"));
    assert_eq!(attachment.contents(), FAKE_PDF);
}

#[tokio::test]
async fn test_fixed_contract_bills_without_entries() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "EUR").await;
    let contract = ContractFixture::fixed(seed.client.id, "1200", "EUR");
    insert_contract_fixture(store.pool(), &contract).await;

    let job = ctx.billing_job(accepting_transport(), pdf_renderer());
    let result = job.run(at(2024, 4, 1, 9), &CancellationToken::new()).await.unwrap();

    match outcome_for(&result, contract.id) {
        ContractOutcome::Generated {
            window,
            number,
            total,
            currency,
            delivery,
            ..
        } => {
            assert_eq!(*window, march());
            assert_eq!(number, "INV-000001");
            assert_eq!(total.to_string(), "1200.00");
            assert_eq!(currency, "EUR");
            assert_eq!(*delivery, DeliveryStatus::Delivered);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_second_cycle_generates_nothing() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    let contract = ContractFixture::fixed(seed.client.id, "800.00", "USD");
    insert_contract_fixture(store.pool(), &contract).await;

    let job = ctx.billing_job(accepting_transport(), pdf_renderer());
    let cancel = CancellationToken::new();
    let first = job.run(at(2024, 4, 1, 9), &cancel).await.unwrap();
    let second = job.run(at(2024, 4, 1, 15), &cancel).await.unwrap();

    assert_eq!(first.invoices_generated, 1);
    assert_eq!(second.invoices_generated, 0);
    assert_eq!(second.contracts_checked, 1);
    assert!(matches!(outcome_for(&second, contract.id), ContractOutcome::NotDue));
    assert_eq!(count_table_rows(store.pool(), "invoices").await, 1);
    assert_eq!(count_table_rows(store.pool(), "delivery_attempts").await, 1);
}

#[tokio::test]
async fn test_concurrent_cycles_produce_one_invoice() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    let contract = ContractFixture::hourly(seed.client.id, "80.00", "USD");
    insert_contract_fixture(store.pool(), &contract).await;
    insert_time_entry_fixture(
        store.pool(),
        &TimeEntryFixture::lasting(contract.id, at(2024, 3, 12, 10), 45),
    )
    .await;

    // A second process: separate pools and writer locks over the same files.
    let other_pools = Arc::new(TenantPools::new(ctx.dir.path().join("tenants"), PoolConfig::default()));
    let (other_transport, other_sent) = recording_transport();
    let other = RecurringBillingJob::new(
        other_pools.clone(),
        pdf_renderer(),
        Arc::new(DeliveryService::new(other_transport, &smtp_config())),
        &BillingConfig::default(),
        ctx.documents_dir(),
        4,
    );
    let (transport, sent) = recording_transport();
    let job = ctx.billing_job(transport, pdf_renderer());

    let cancel = CancellationToken::new();
    let now = at(2024, 4, 1, 9);
    let (left, right) = tokio::join!(job.run(now, &cancel), other.run(now, &cancel));
    let (left, right) = (left.unwrap(), right.unwrap());

    assert_eq!(left.invoices_generated + right.invoices_generated, 1);
    assert!(left.errors.is_empty(), "{:?}", left.errors);
    assert!(right.errors.is_empty(), "{:?}", right.errors);
    for outcome in [outcome_for(&left, contract.id), outcome_for(&right, contract.id)] {
        assert!(matches!(
            outcome,
            ContractOutcome::Generated { .. }
                | ContractOutcome::Resumed { .. }
                | ContractOutcome::AlreadyGenerated { .. }
                | ContractOutcome::NotDue
                | ContractOutcome::NothingToBill { .. }
        ));
    }
    assert_eq!(count_table_rows(store.pool(), "invoices").await, 1);
    assert_eq!(count_table_rows(store.pool(), "invoice_counters").await, 1);

    // Whichever run holds the delivery claim sends the invoice; the other does not.
    let delivered = sent.lock().unwrap().len() + other_sent.lock().unwrap().len();
    assert_eq!(delivered, 1);
    let invoice = &store.invoices_for_contract(contract.id).await.unwrap()[0];
    assert_eq!(invoice.delivery_status, DeliveryStatus::Delivered);

    other_pools.close_all().await;
}

#[tokio::test]
async fn test_currency_mismatch_does_not_stop_other_contracts() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    let euro = ContractFixture::fixed(seed.client.id, "500.00", "EUR");
    let dollar = ContractFixture::fixed(seed.client.id, "700.00", "USD");
    insert_contract_fixture(store.pool(), &euro).await;
    insert_contract_fixture(store.pool(), &dollar).await;

    let job = ctx.billing_job(accepting_transport(), pdf_renderer());
    let result = job.run(at(2024, 4, 1, 9), &CancellationToken::new()).await.unwrap();

    assert!(matches!(
        outcome_for(&result, euro.id),
        ContractOutcome::Failed {
            error: BillingError::CurrencyMismatch { .. },
            window: Some(_),
        }
    ));
    assert!(matches!(outcome_for(&result, dollar.id), ContractOutcome::Generated { .. }));
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains(&euro.id.to_string()));
    assert!(store.invoices_for_contract(euro.id).await.unwrap().is_empty());
    assert_eq!(store.invoices_for_contract(dollar.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unconfigured_smtp_creates_no_invoice() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    let contract = ContractFixture::fixed(seed.client.id, "300.00", "USD");
    insert_contract_fixture(store.pool(), &contract).await;

    let job = ctx.billing_job_with(DeliveryService::disabled(&smtp_config()), pdf_renderer());
    let result = job.run(at(2024, 4, 1, 9), &CancellationToken::new()).await.unwrap();

    match outcome_for(&result, contract.id) {
        ContractOutcome::Failed { error, .. } => assert!(error.is_configuration()),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(count_table_rows(store.pool(), "invoices").await, 0);
}

#[tokio::test]
async fn test_empty_hourly_period_is_skipped_and_ledger_advances() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    let contract = ContractFixture::hourly(seed.client.id, "60.00", "USD");
    insert_contract_fixture(store.pool(), &contract).await;

    let job = ctx.billing_job(accepting_transport(), pdf_renderer());
    let cancel = CancellationToken::new();

    let first = job.run(at(2024, 4, 1, 9), &cancel).await.unwrap();
    assert!(matches!(
        outcome_for(&first, contract.id),
        ContractOutcome::NothingToBill { window } if *window == march()
    ));
    assert_eq!(first.nothing_to_bill, 1);

    let next_day = job.run(at(2024, 4, 2, 9), &cancel).await.unwrap();
    assert!(matches!(outcome_for(&next_day, contract.id), ContractOutcome::NotDue));

    insert_time_entry_fixture(
        store.pool(),
        &TimeEntryFixture::lasting(contract.id, at(2024, 4, 10, 14), 60),
    )
    .await;
    let may = job.run(at(2024, 5, 1, 9), &cancel).await.unwrap();
    match outcome_for(&may, contract.id) {
        ContractOutcome::Generated { window, total, .. } => {
            assert_eq!(window.start, date(2024, 4, 1));
            assert_eq!(window.end, date(2024, 5, 1));
            assert_eq!(*total, Decimal::new(6000, 2));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn test_always_bill_hourly_contract_invoices_zero_hours() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    let contract = ContractFixture {
        always_bill: true,
        ..ContractFixture::hourly(seed.client.id, "60.00", "USD")
    };
    insert_contract_fixture(store.pool(), &contract).await;

    let job = ctx.billing_job(accepting_transport(), pdf_renderer());
    let result = job.run(at(2024, 4, 1, 9), &CancellationToken::new()).await.unwrap();

    assert!(matches!(
        outcome_for(&result, contract.id),
        ContractOutcome::Generated { total, .. } if total.is_zero()
    ));

    // One zero-hour line at the contract rate; no minimum amount is added.
    let invoice = &store.invoices_for_contract(contract.id).await.unwrap()[0];
    assert_eq!(invoice.line_items.len(), 1);
    assert!(invoice.line_items[0].quantity.is_zero());
    assert_eq!(invoice.line_items[0].unit_rate, Decimal::new(6000, 2));
    assert!(invoice.total().is_zero());
    assert_eq!(invoice.status, InvoiceStatus::Sent);
}

#[tokio::test]
async fn test_invoice_numbers_are_per_tenant() {
    let ctx = TestContext::new();
    for tenant in ["acme", "globex"] {
        let store = ctx.tenant(tenant).await;
        let seed = seed_tenant(store.pool(), "USD").await;
        for price in ["100.00", "200.00"] {
            let contract = ContractFixture::fixed(seed.client.id, price, "USD");
            insert_contract_fixture(store.pool(), &contract).await;
        }
    }

    let job = ctx.billing_job(accepting_transport(), pdf_renderer());
    let result = job.run(at(2024, 4, 1, 9), &CancellationToken::new()).await.unwrap();
    assert_eq!(result.tenants_processed, 2);
    assert_eq!(result.invoices_generated, 4);
    assert_eq!(result.total_amount_invoiced.get("USD"), Some(&Decimal::new(60000, 2)));

    for tenant in ["acme", "globex"] {
        let store = ctx.tenants.store(tenant).await.unwrap();
        let mut numbers: Vec<i64> = sqlx::query_scalar("SELECT number FROM invoices")
            .fetch_all(store.pool())
            .await
            .unwrap();
        numbers.sort();
        assert_eq!(numbers, vec![1, 2]);
    }
}

#[tokio::test]
async fn test_cancelled_cycle_checks_nothing() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    insert_contract_fixture(store.pool(), &ContractFixture::fixed(seed.client.id, "100.00", "USD")).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let job = ctx.billing_job(unused_transport(), pdf_renderer());
    let result = job.run(at(2024, 4, 1, 9), &cancel).await.unwrap();

    assert_eq!(result.invoices_generated, 0);
    assert_eq!(count_table_rows(store.pool(), "invoices").await, 0);
}

#[tokio::test]
async fn test_scheduler_keeps_execution_log() {
    let ctx = TestContext::new();
    let store = ctx.tenant("acme").await;
    let seed = seed_tenant(store.pool(), "USD").await;
    insert_contract_fixture(store.pool(), &ContractFixture::fixed(seed.client.id, "100.00", "USD")).await;
    insert_contract_fixture(store.pool(), &ContractFixture::fixed(seed.client.id, "100.00", "GBP")).await;

    let job = ctx.billing_job(accepting_transport(), pdf_renderer());
    let scheduler = JobScheduler::new(
        Arc::new(job),
        DailyTrigger::new(NaiveTime::from_hms_opt(9, 0, 0).unwrap()),
    );
    let cancel = CancellationToken::new();
    scheduler.run_cycle(at(2024, 4, 1, 9), &cancel).await.unwrap();
    scheduler.run_cycle(at(2024, 4, 2, 9), &cancel).await.unwrap();

    let logs = scheduler.get_execution_logs().await;
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].status, JobStatus::PartialFailure);
    assert_eq!(logs[0].items_processed, 2);
    assert_eq!(logs[0].errors.len(), 1);
    // The mismatched contract fails again on every cycle.
    assert_eq!(logs[1].status, JobStatus::PartialFailure);
    assert!(logs.iter().all(|log| log.completed_at.is_some()));
}
