use std::collections::BTreeSet;

use netweave_core::PeerId;

use super::Route;

/// Every member holds a direct channel to every other member.
#[derive(Debug, Default)]
pub struct FullMesh;

impl FullMesh {
    /// A joiner must reach every current member.
    pub fn connect_set(&self, members: &BTreeSet<PeerId>) -> Vec<PeerId> {
        members.iter().copied().collect()
    }

    pub fn route(&self, dest: PeerId, linked: impl Fn(PeerId) -> bool) -> Route {
        if linked(dest) {
            Route::Direct
        } else {
            Route::Unreachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlinked_member_is_unreachable() {
        let mesh = FullMesh;
        assert_eq!(mesh.route(3, |id| id == 3), Route::Direct);
        assert_eq!(mesh.route(4, |id| id == 3), Route::Unreachable);
    }
}
