use crate::error::{Error, ErrorKind};
use crate::fingerprint::Fingerprint;
use crate::ttl::TtlClass;
use exn::{OptionExt, ResultExt};
use rangedb_engine::Rows;
use rangedb_fetch::FileVersion;

/// One row of the `results` table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ResultRow {
    pub(crate) fingerprint: String,
    pub(crate) file_version: String,
    pub(crate) ttl_class: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) payload_size: i64,
    pub(crate) created_at: i64,
    pub(crate) expires_at: i64,
    pub(crate) last_access_at: i64,
    pub(crate) hits: i64,
}

impl ResultRow {
    pub(crate) fn new(
        fingerprint: &Fingerprint,
        version: &FileVersion,
        ttl: TtlClass,
        rows: &Rows,
        created_at: i64,
        expires_at: i64,
    ) -> Result<Self, Error> {
        let payload = serde_json::to_vec(rows).or_raise(|| ErrorKind::InvalidData("rows"))?;
        Ok(Self {
            fingerprint: fingerprint.to_hex(),
            file_version: version.to_string(),
            ttl_class: ttl.to_string(),
            payload_size: i64::try_from(payload.len()).or_raise(|| ErrorKind::InvalidData("payload size"))?,
            payload,
            created_at,
            expires_at,
            last_access_at: created_at,
            hits: 0,
        })
    }

    pub(crate) fn ttl_class(&self) -> Result<TtlClass, Error> {
        self.ttl_class.parse().ok().ok_or_raise(|| ErrorKind::InvalidData("ttl class"))
    }

    pub(crate) fn rows(&self) -> Result<Rows, Error> {
        serde_json::from_slice(&self.payload).or_raise(|| ErrorKind::InvalidData("rows"))
    }

    pub(crate) fn hits(&self) -> u64 {
        u64::try_from(self.hits).unwrap_or(0)
    }
}

/// The columns needed to rank entries for eviction.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CandidateRow {
    pub(crate) fingerprint: String,
    pub(crate) payload_size: i64,
    pub(crate) last_access_at: i64,
    pub(crate) hits: i64,
}
