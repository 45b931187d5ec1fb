use deadpool::managed::{self, Pool, PoolConfig, RecycleError, RecycleResult};
use libsql::{Builder, Connection, Database, Error as LibsqlError};

pub struct LibsqlManager {
    database: Database,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        self.database.connect()
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Self::Error> {
        let row = conn.query("SELECT 1", ()).await?.next().await?;
        match row {
            Some(_) => Ok(()),
            None => Err(RecycleError::Message("connection health check returned no rows".into())),
        }
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Open a local database file and wrap it in a pool of `max_size` connections
pub async fn open_local(path: &str, max_size: usize) -> anyhow::Result<LibsqlPool> {
    let database = Builder::new_local(path).build().await?;
    let pool = Pool::builder(LibsqlManager::new(database))
        .config(PoolConfig::new(max_size.max(1)))
        .build()?;
    Ok(pool)
}
