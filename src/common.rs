pub use anyhow::{bail, ensure, format_err, Context, Result};
pub use itertools::{izip, Itertools};
pub use log::{info, warn};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    collections::{BTreeMap, BTreeSet},
    fs, iter,
    path::{Path, PathBuf},
};
pub use tch::{
    kind::FLOAT_CPU,
    nn::{self, ModuleT},
    Device, Kind, Tensor,
};
