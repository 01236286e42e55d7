// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use super::{internal::ManagerMessage, ManagerHandle};
use crate::{api::WriteType, gate::Gate, Error, Result};
use uuid::Uuid;

/// Issues writes. Each write waits on its own gate, so its completion (or error) reaches the
/// caller that issued it.
#[derive(Clone, Debug)]
pub(crate) struct WriteCoordinator {
    handle: ManagerHandle,
}

impl WriteCoordinator {
    pub(crate) fn new(handle: ManagerHandle) -> Self {
        WriteCoordinator { handle }
    }

    pub(crate) async fn write(
        &self,
        characteristic: Uuid,
        data: &[u8],
        write_type: WriteType,
    ) -> Result<()> {
        let timeout = self.handle.config().write_timeout;
        let (gate, completion) = Gate::new();
        self.handle.send(ManagerMessage::Write {
            characteristic,
            data: data.to_vec(),
            write_type,
            gate,
        })?;
        completion
            .wait(timeout)
            .await
            .into_result(|| Error::TimedOut(timeout))?
    }
}
