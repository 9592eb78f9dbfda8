pub(crate) mod federal_register;
pub(crate) mod fema;
pub(crate) mod grants_gov;
pub(crate) mod nih_reporter;
pub(crate) mod nsf_awards;
