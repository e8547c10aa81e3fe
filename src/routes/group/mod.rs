mod handler;
pub mod model;

pub use handler::{
    add_member, create_group, delete_group, get_group, list_groups, remove_member,
    require_admin, require_member, update_group,
};
