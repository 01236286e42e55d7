// blecentral Source Code File
//
// Copyright 2020 Nonpolynomial. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

use futures::channel::mpsc::UnboundedSender;

/// Sends `n` to every subscriber, dropping subscribers whose receiving end is gone.
pub(crate) fn send_notification<T: Clone>(senders: &mut Vec<UnboundedSender<T>>, n: &T) {
    senders.retain(|sender| sender.unbounded_send(n.clone()).is_ok());
}
