use std::fmt;

use serde::{Deserialize, Serialize};

use super::role::Role;

/// Named action a member can attempt inside their current organization.
///
/// The registry is static: each action maps to the lowest [`Role`] allowed to
/// perform it, and extending the system means adding a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    ViewOrganization,
    EditOrganization,
    DeactivateOrganization,
    ViewUsers,
    InviteUsers,
    ManageUsers,
    RemoveUsers,
    ViewInvitations,
    ViewLocations,
    ManageLocations,
    ViewEquipment,
    CreateEquipment,
    EditEquipment,
    DeleteEquipment,
    ViewWorkOrders,
    DispatchWorkOrders,
    CompleteWorkOrders,
    CreateEstimates,
    ManageBilling,
}

impl Action {
    pub const ALL: [Action; 19] = [
        Action::ViewOrganization,
        Action::EditOrganization,
        Action::DeactivateOrganization,
        Action::ViewUsers,
        Action::InviteUsers,
        Action::ManageUsers,
        Action::RemoveUsers,
        Action::ViewInvitations,
        Action::ViewLocations,
        Action::ManageLocations,
        Action::ViewEquipment,
        Action::CreateEquipment,
        Action::EditEquipment,
        Action::DeleteEquipment,
        Action::ViewWorkOrders,
        Action::DispatchWorkOrders,
        Action::CompleteWorkOrders,
        Action::CreateEstimates,
        Action::ManageBilling,
    ];

    /// Lowest role allowed to perform this action.
    pub const fn minimum_role(self) -> Role {
        match self {
            Action::ViewOrganization => Role::User,
            Action::EditOrganization => Role::Manager,
            Action::DeactivateOrganization => Role::Administrator,
            Action::ViewUsers => Role::Supervisor,
            Action::InviteUsers => Role::Manager,
            Action::ManageUsers => Role::Manager,
            Action::RemoveUsers => Role::Administrator,
            Action::ViewInvitations => Role::Manager,
            Action::ViewLocations => Role::Customer,
            Action::ManageLocations => Role::Manager,
            Action::ViewEquipment => Role::Customer,
            Action::CreateEquipment => Role::Technician,
            Action::EditEquipment => Role::Technician,
            Action::DeleteEquipment => Role::Manager,
            Action::ViewWorkOrders => Role::Customer,
            Action::DispatchWorkOrders => Role::Dispatcher,
            Action::CompleteWorkOrders => Role::Technician,
            Action::CreateEstimates => Role::Estimator,
            Action::ManageBilling => Role::Administrator,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Action::ViewOrganization => "viewOrganization",
            Action::EditOrganization => "editOrganization",
            Action::DeactivateOrganization => "deactivateOrganization",
            Action::ViewUsers => "viewUsers",
            Action::InviteUsers => "inviteUsers",
            Action::ManageUsers => "manageUsers",
            Action::RemoveUsers => "removeUsers",
            Action::ViewInvitations => "viewInvitations",
            Action::ViewLocations => "viewLocations",
            Action::ManageLocations => "manageLocations",
            Action::ViewEquipment => "viewEquipment",
            Action::CreateEquipment => "createEquipment",
            Action::EditEquipment => "editEquipment",
            Action::DeleteEquipment => "deleteEquipment",
            Action::ViewWorkOrders => "viewWorkOrders",
            Action::DispatchWorkOrders => "dispatchWorkOrders",
            Action::CompleteWorkOrders => "completeWorkOrders",
            Action::CreateEstimates => "createEstimates",
            Action::ManageBilling => "manageBilling",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
