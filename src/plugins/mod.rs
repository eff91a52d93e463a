mod accounts;
mod check_in;

pub use accounts::AccountsPlugin;
pub use check_in::CheckInPlugin;

use crate::fragment::Plugin;

pub fn catalog() -> Vec<Box<dyn Plugin>> {
    vec![Box::new(AccountsPlugin), Box::new(CheckInPlugin)]
}

pub fn find(name: &str) -> Option<Box<dyn Plugin>> {
    catalog().into_iter().find(|plugin| plugin.namespace() == name)
}
