use async_trait::async_trait;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use diamondchain_types::*;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};
use tracing::info;
use std::time::Duration;
use uuid::Uuid;

use crate::{QueryGateway, VaultRecorder};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS diamondasset_states (
    tx_id              TEXT NOT NULL,
    record_id          UUID NOT NULL,
    asset_kind         TEXT NOT NULL,
    source             TEXT NOT NULL,
    owner              TEXT NOT NULL,
    approver           TEXT,
    approval_status    TEXT NOT NULL,
    description        TEXT NOT NULL,
    carats             DOUBLE PRECISION NOT NULL,
    cost               DOUBLE PRECISION NOT NULL,
    percent_fee        DOUBLE PRECISION NOT NULL,
    box_value          DOUBLE PRECISION NOT NULL,
    amount             DOUBLE PRECISION NOT NULL,
    credit_duration    INTEGER NOT NULL,
    date_issued        TIMESTAMPTZ NOT NULL,
    date_sold          TIMESTAMPTZ,
    last_purchase_date TIMESTAMPTZ,
    approval_date      TIMESTAMPTZ,
    consumed_by        TEXT,
    recorded_at        TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (tx_id, record_id)
);
CREATE INDEX IF NOT EXISTS idx_diamondasset_states_current
    ON diamondasset_states (record_id) WHERE consumed_by IS NULL;
"#;

const SELECT_COLUMNS: &str = r#"
    tx_id, record_id, asset_kind, source, owner, approver, approval_status,
    description, carats, cost, percent_fee, box_value, amount, credit_duration,
    date_issued, date_sold, last_purchase_date, approval_date
"#;

/// Vault backed by PostgreSQL, one row per record version
pub struct PostgresVault {
    pool: Pool,
}

impl PostgresVault {
    pub async fn new(config: &PostgresConfig) -> Result<Self> {
        let pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::StorageError(format!("Invalid connection string: {}", e)))?;

        let mut cfg = Config::new();
        cfg.host = pg_config.get_hosts().first().and_then(|h| match h {
            tokio_postgres::config::Host::Tcp(s) => Some(s.clone()),
            #[allow(unreachable_patterns)]
            _ => None,
        });
        cfg.port = pg_config.get_ports().first().copied();
        cfg.dbname = pg_config.get_dbname().map(|s| s.to_string());
        cfg.user = pg_config.get_user().map(|s| s.to_string());
        cfg.password = pg_config
            .get_password()
            .map(|p| String::from_utf8_lossy(p).to_string());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_config = PoolConfig::new(config.max_connections.max(1) as usize);
        pool_config.timeouts.create = Some(Duration::from_secs(config.connect_timeout_secs));
        pool_config.timeouts.wait = Some(Duration::from_secs(config.connect_timeout_secs));
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| Error::StorageError(format!("Failed to create pool: {}", e)))?;

        let vault = Self { pool };
        vault.migrate().await?;

        info!("PostgreSQL vault initialized successfully");

        Ok(vault)
    }

    async fn migrate(&self) -> Result<()> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| Error::StorageError(format!("Failed to get client: {}", e)))?;

        client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to apply schema: {}", e)))?;

        Ok(())
    }

    async fn query_current(
        &self,
        filter: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<StateAndRef>> {
        let client = self
            .pool
            .get()
            .await
            .map_err(|e| Error::StorageError(format!("Failed to get client: {}", e)))?;

        let sql = format!(
            "SELECT {} FROM diamondasset_states \
             WHERE consumed_by IS NULL AND {} ORDER BY date_issued",
            SELECT_COLUMNS, filter
        );

        let rows = client
            .query(sql.as_str(), params)
            .await
            .map_err(|e| Error::StorageError(format!("Failed to query current states: {}", e)))?;

        rows.iter().map(row_to_state).collect()
    }
}

fn row_to_state(row: &Row) -> Result<StateAndRef> {
    let tx_id: String = row.get("tx_id");
    let record_id: Uuid = row.get("record_id");
    let asset_kind: String = row.get("asset_kind");
    let approval_status: String = row.get("approval_status");
    let source: String = row.get("source");
    let owner: String = row.get("owner");
    let approver: Option<String> = row.get("approver");

    let asset_kind = match asset_kind.as_str() {
        "SIGHT" => AssetKind::Sight,
        other => {
            return Err(Error::StorageError(format!("Invalid asset kind: {}", other)));
        }
    };

    let record = AssetRecord {
        record_id: RecordId(record_id),
        asset_kind,
        source: PartyName(source),
        owner: PartyName(owner),
        approver: approver.map(PartyName),
        approval_status: approval_status.parse()?,
        description: row.get("description"),
        carats: row.get("carats"),
        cost: row.get("cost"),
        percent_fee: row.get("percent_fee"),
        box_value: row.get("box_value"),
        amount: row.get("amount"),
        credit_duration: row.get("credit_duration"),
        date_issued: row.get("date_issued"),
        date_sold: row.get("date_sold"),
        last_purchase_date: row.get("last_purchase_date"),
        approval_date: row.get("approval_date"),
    };

    Ok(StateAndRef {
        state_ref: StateRef {
            tx_id: TxId(tx_id),
            record_id: RecordId(record_id),
        },
        record,
    })
}

#[async_trait]
impl QueryGateway for PostgresVault {
    async fn find_current(
        &self,
        record_id: RecordId,
        held_by: &PartyName,
    ) -> Result<Vec<StateAndRef>> {
        self.query_current(
            "record_id = $1 AND (source = $2 OR owner = $2 OR approver = $2)",
            &[&record_id.0, &held_by.0],
        )
        .await
    }

    async fn list_current(&self, held_by: &PartyName) -> Result<Vec<StateAndRef>> {
        self.query_current("(source = $1 OR owner = $1 OR approver = $1)", &[&held_by.0])
            .await
    }
}

#[async_trait]
impl VaultRecorder for PostgresVault {
    async fn record_transition(&self, finalized: &FinalizedTransition) -> Result<()> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| Error::StorageError(format!("Failed to get client: {}", e)))?;

        let tx = client
            .transaction()
            .await
            .map_err(|e| Error::StorageError(format!("Failed to begin transaction: {}", e)))?;

        let tx_id = &finalized.signed.tx_id;

        for consumed in &finalized.signed.proposal.consumed {
            tx.execute(
                r#"
                UPDATE diamondasset_states
                SET consumed_by = $3
                WHERE tx_id = $1 AND record_id = $2 AND consumed_by IS NULL
                "#,
                &[&consumed.state_ref.tx_id.0, &consumed.state_ref.record_id.0, &tx_id.0],
            )
            .await
            .map_err(|e| Error::StorageError(format!("Failed to consume state: {}", e)))?;
        }

        for record in &finalized.signed.proposal.produced {
            let approver = record.approver.as_ref().map(|a| a.0.clone());
            tx.execute(
                r#"
                INSERT INTO diamondasset_states (
                    tx_id, record_id, asset_kind, source, owner, approver, approval_status,
                    description, carats, cost, percent_fee, box_value, amount, credit_duration,
                    date_issued, date_sold, last_purchase_date, approval_date
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9,
                        $10, $11, $12, $13, $14, $15, $16, $17, $18)
                ON CONFLICT (tx_id, record_id) DO NOTHING
                "#,
                &[
                    &tx_id.0,
                    &record.record_id.0,
                    &record.asset_kind.to_string(),
                    &record.source.0,
                    &record.owner.0,
                    &approver,
                    &record.approval_status.to_string(),
                    &record.description,
                    &record.carats,
                    &record.cost,
                    &record.percent_fee,
                    &record.box_value,
                    &record.amount,
                    &record.credit_duration,
                    &record.date_issued,
                    &record.date_sold,
                    &record.last_purchase_date,
                    &record.approval_date,
                ],
            )
            .await
            .map_err(|e| Error::StorageError(format!("Failed to insert state: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::StorageError(format!("Failed to commit transaction: {}", e)))?;

        info!(
            "Recorded transition tx_id={} consumed={} produced={}",
            tx_id,
            finalized.signed.proposal.consumed.len(),
            finalized.signed.proposal.produced.len()
        );

        Ok(())
    }
}
