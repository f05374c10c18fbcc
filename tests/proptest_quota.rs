use chrono::{DateTime, Duration, Local, NaiveDate, TimeZone, Utc};
use imagine_gateway::bot::transport::split_message;
use imagine_gateway::commands;
use imagine_gateway::identity::{Identity, ReplyTarget};
use imagine_gateway::quota::QuotaLedger;
use imagine_gateway::storage::JsonFile;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn local_time(day: NaiveDate, hour: u32) -> DateTime<Utc> {
    let naive = day.and_hms_opt(hour, 0, 0).expect("valid time");
    Local
        .from_local_datetime(&naive)
        .earliest()
        .expect("local time exists")
        .with_timezone(&Utc)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Balances never wrap below zero no matter how many debits land.
    #[test]
    fn debits_clamp_at_zero(limit in 0u32..20, debits in proptest::collection::vec(0u32..5, 0..12)) {
        let rt = runtime();
        let dir = std::env::temp_dir()
            .join(format!("imagine-prop-{}", uuid::Uuid::new_v4().as_simple()));
        let remaining = rt.block_on(async {
            let ledger = QuotaLedger::open(JsonFile::new(dir.join("quota.json")), limit, 30)
                .await
                .expect("ledger");
            let identity = Identity::direct("u-1", "alice");
            ledger.get_or_init(&identity).await.expect("init");
            for amount in &debits {
                ledger.debit(&identity.key(), *amount).await.expect("debit");
            }
            let record = ledger.get(&identity.key()).await.expect("record");
            let _ = tokio::fs::remove_dir_all(&dir).await;
            record.remaining
        });

        let spent: u32 = debits.iter().sum();
        prop_assert_eq!(remaining, limit.saturating_sub(spent));
    }

    /// Whatever happens during a day, the next day starts from the full
    /// limit exactly once.
    #[test]
    fn rollover_resets_once_per_day(
        spent in 1u32..10,
        accesses in proptest::collection::vec(10u32..20, 1..6)
    ) {
        let rt = runtime();
        let dir = std::env::temp_dir()
            .join(format!("imagine-prop-{}", uuid::Uuid::new_v4().as_simple()));
        let day_one = NaiveDate::from_ymd_opt(2024, 5, 1).expect("valid date");
        let day_two = day_one + Duration::days(1);
        let seen = rt.block_on(async {
            let ledger = QuotaLedger::open(JsonFile::new(dir.join("quota.json")), 10, 30)
                .await
                .expect("ledger");
            let identity = Identity::direct("u-1", "alice");
            ledger
                .get_or_init_at(&identity, local_time(day_one, 9))
                .await
                .expect("init");
            ledger
                .debit_at(&identity.key(), spent, local_time(day_one, 10))
                .await
                .expect("debit");

            let mut seen = Vec::new();
            for hour in &accesses {
                let record = ledger
                    .get_or_init_at(&identity, local_time(day_two, *hour))
                    .await
                    .expect("access");
                seen.push(record.remaining);
                ledger
                    .debit_at(&identity.key(), 1, local_time(day_two, *hour))
                    .await
                    .expect("debit");
            }
            let _ = tokio::fs::remove_dir_all(&dir).await;
            seen
        });

        // First access of the new day sees the full limit, later ones only
        // their own debits
        let expected: Vec<u32> = (1..=10u32).rev().take(seen.len()).collect();
        prop_assert_eq!(seen, expected);
    }

    /// Chunks respect the limit and lose nothing.
    #[test]
    fn split_message_preserves_text(text in "(\\PC{0,60}\n?){0,20}", limit in 1usize..50) {
        let parts = split_message(&text, limit);
        for part in &parts {
            prop_assert!(part.chars().count() <= limit, "chunk over limit: {:?}", part);
        }
        prop_assert_eq!(parts.concat(), text);
    }

    /// The reply target survives the state field of the rendering service.
    #[test]
    fn reply_target_state_round_trips(
        room in proptest::bool::ANY,
        receiver in "-?[0-9]{1,15}",
        name in "[^\n]{0,30}"
    ) {
        let target = if room {
            ReplyTarget::room(receiver, name)
        } else {
            ReplyTarget::direct(receiver, name)
        };
        prop_assert_eq!(ReplyTarget::parse(&target.to_state()), Some(target));
    }

    /// Arbitrary chat text never panics the command parser.
    #[test]
    fn command_parser_does_not_crash(s in "\\PC*") {
        let _ = commands::parse(&s, "$");
        if let Some(Ok(parsed)) = commands::parse(&format!("${s}"), "$") {
            prop_assert!(parsed.spec.aliases.iter().any(|a| s.trim_start().starts_with(a)));
        }
    }
}
