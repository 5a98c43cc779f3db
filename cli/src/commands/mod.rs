mod helpers;
mod meal;
mod profile;
mod summary;
mod sync;
mod weight;

pub(crate) use meal::{MealArgs, cmd_meal_delete, cmd_meal_list, cmd_meal_log};
pub(crate) use profile::{cmd_profile_set, cmd_profile_show};
pub(crate) use summary::cmd_summary;
pub(crate) use sync::{LoginArgs, SyncMode, cmd_login, cmd_logout, cmd_status, cmd_sync};
pub(crate) use weight::{cmd_weight_delete, cmd_weight_history, cmd_weight_log};
