//! Command batching.
//!
//! Builders hand back [`Command`] values instead of touching the wire.
//! Callers gather any number of them and submit the lot as one transact
//! call, so either every operation commits or none do.

use ovsdb_link::ops::Operation;
use uuid::Uuid;

use crate::client::Client;
use crate::error::Error;

/// One or more transact operations produced by a single builder call.
#[derive(Clone, Debug)]
pub struct Command {
    operations: Vec<Operation>,
}

impl Command {
    pub(crate) fn new(operations: Vec<Operation>) -> Command {
        Command { operations }
    }

    pub(crate) fn single(operation: Operation) -> Command {
        Command {
            operations: vec![operation],
        }
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }
}

impl Client {
    /// Commit the given commands as one atomic transaction.
    pub async fn execute(&self, commands: impl IntoIterator<Item = Command>) -> Result<(), Error> {
        self.execute_returning_ids(commands).await.map(drop)
    }

    /// Commit the given commands and report the row ids the server
    /// assigned to the batch's inserts, in operation order.
    pub async fn execute_returning_ids(
        &self,
        commands: impl IntoIterator<Item = Command>,
    ) -> Result<Vec<Uuid>, Error> {
        let operations: Vec<Operation> = commands
            .into_iter()
            .flat_map(|command| command.operations)
            .collect();
        if operations.is_empty() {
            return Ok(Vec::new());
        }
        let results = self.inner.transact(&operations).await?;
        Ok(results.into_iter().filter_map(|result| result.uuid).collect())
    }
}
