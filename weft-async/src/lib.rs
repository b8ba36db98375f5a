// Copyright © 2026 The Weft Contributors
//
// This file is part of weft, distributed under the terms of the GPLv3
// or later. For full terms see the included LICENSE file.

mod spawn;
pub use spawn::{Cancelled, Spawner, Task};

mod time;
pub use time::{interval, sleep, timeout, Elapsed, Interval};
