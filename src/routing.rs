use std::net::SocketAddrV4;
use time::{Duration, SteadyTime};

use crate::id::NodeId;
use crate::node::contact::NodeContact;
use crate::{BUCKET_CAPACITY, BUCKET_REFRESH_INTERVAL, ID_LENGTH, REPLICATION_PARAM};

/// One node of the routing trie.
///
/// A bucket is either a leaf holding up to `BUCKET_CAPACITY` contacts or an
/// internal node with exactly two children, never both. The first `depth`
/// bits of `prefix` are the slice of the ID space the bucket covers.
#[derive(Clone, Debug)]
struct Bucket {
    depth: usize,
    prefix: NodeId,
    contacts: Option<Vec<NodeContact>>,
    children: Option<(usize, usize)>,
    parent: Option<usize>,
    last_changed: SteadyTime,
}

impl Bucket {
    fn leaf(depth: usize, prefix: NodeId, contacts: Vec<NodeContact>, parent: Option<usize>) -> Self {
        Bucket {
            depth,
            prefix,
            contacts: Some(contacts),
            children: None,
            parent,
            last_changed: SteadyTime::now(),
        }
    }
}

/// A node's routing table: a binary trie of k-buckets over the ID space.
///
/// The trie is stored as an arena of buckets addressed by index, with parent
/// and child links held as indices rather than owning references. Only the
/// leaf containing the local node splits when full, so the table holds fine
/// topology knowledge around the local ID and progressively coarser knowledge
/// further away. Contacts whose ID is not yet resolved route by the local ID
/// and live in the local node's leaf until their first successful RPC.
pub struct RoutingTable {
    arena: Vec<Bucket>,
    free: Vec<usize>,
    root: usize,
    local_id: NodeId,
}

impl RoutingTable {
    /// Constructs a routing table whose root leaf holds only the local node.
    pub fn new(local_id: NodeId, local_addr: SocketAddrV4) -> Self {
        let local = NodeContact::local(local_id, local_addr);
        let root = Bucket::leaf(0, NodeId::default(), vec![local], None);
        RoutingTable {
            arena: vec![root],
            free: Vec::new(),
            root: 0,
            local_id,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Inserts `contact` into the leaf covering its ID.
    ///
    /// Duplicates (by ID, or by endpoint for unresolved contacts) are
    /// rejected. A full leaf first tries to evict a stale slot in favor of a
    /// live newcomer, then splits if it contains the local node and splitting
    /// can actually separate its occupants from the new contact, and
    /// otherwise rejects the insertion. A leaf full of unresolved stubs all
    /// routing by the local ID therefore rejects further stubs.
    pub fn add_contact(&mut self, contact: NodeContact) -> bool {
        if contact.is_local || contact.id == Some(self.local_id) {
            return false;
        }
        let route_id = self.route_id(&contact);
        loop {
            let leaf = self.leaf_for(&route_id);
            {
                let bucket = &mut self.arena[leaf];
                let contacts = bucket.contacts.as_mut().expect("leaf bucket has contacts");
                if contacts.iter().any(|existing| *existing == contact) {
                    return false;
                }
                if contacts.len() < BUCKET_CAPACITY {
                    contacts.push(contact);
                    bucket.last_changed = SteadyTime::now();
                    return true;
                }
                if !contact.is_stale() {
                    let stale_slot = contacts
                        .iter()
                        .position(|existing| !existing.is_local && existing.is_stale());
                    if let Some(slot) = stale_slot {
                        contacts[slot] = contact;
                        bucket.last_changed = SteadyTime::now();
                        return true;
                    }
                }
            }
            if self.holds_local(leaf) && self.splittable(leaf, &route_id) {
                self.split(leaf);
                continue;
            }
            return false;
        }
    }

    /// Removes `contact` if its stored entry is stale and its leaf holds
    /// strictly more than `REPLICATION_PARAM` remote contacts, then joins the
    /// sibling leaves back into their parent when everything fits one bucket.
    pub fn remove_contact(&mut self, contact: &NodeContact) -> bool {
        if contact.is_local {
            return false;
        }
        let leaf = self.leaf_for(&self.route_id(contact));
        let parent = self.arena[leaf].parent;
        {
            let bucket = &mut self.arena[leaf];
            let contacts = bucket.contacts.as_mut().expect("leaf bucket has contacts");
            let position = match contacts.iter().position(|existing| existing == contact) {
                Some(position) => position,
                None => return false,
            };
            if !contacts[position].is_stale() {
                return false;
            }
            let remote_count = contacts.iter().filter(|c| !c.is_local).count();
            if remote_count <= REPLICATION_PARAM {
                return false;
            }
            contacts.remove(position);
            bucket.last_changed = SteadyTime::now();
        }
        if let Some(parent) = parent {
            self.try_join(parent);
        }
        true
    }

    /// Returns up to `count` contacts closest to `target` by XOR distance, in
    /// non-decreasing distance order. The local sentinel is never returned.
    pub fn closest_contacts(&self, target: &NodeId, count: usize) -> Vec<NodeContact> {
        let mut ret = Vec::new();
        let mut idx = self.leaf_for(target);
        self.collect_leaf(idx, &mut ret);

        while ret.len() < count {
            let parent = match self.arena[idx].parent {
                Some(parent) => parent,
                None => break,
            };
            let (zero, one) = self.arena[parent].children.expect("parent is internal");
            let sibling = if zero == idx { one } else { zero };
            self.collect_subtree(sibling, &mut ret);
            idx = parent;
        }

        ret.sort_by_key(|contact| contact.distance_to(target));
        ret.truncate(count);
        ret
    }

    /// Returns the contact with `id`, if known.
    pub fn find_contact(&self, id: &NodeId) -> Option<NodeContact> {
        let leaf = self.leaf_for(id);
        self.arena[leaf]
            .contacts
            .as_ref()
            .expect("leaf bucket has contacts")
            .iter()
            .find(|contact| contact.id.as_ref() == Some(id) && !contact.is_local)
            .cloned()
    }

    /// Returns every known remote contact, optionally filtering out stale
    /// ones.
    pub fn all_contacts(&self, include_stale: bool) -> Vec<NodeContact> {
        let mut ret = Vec::new();
        self.collect_subtree(self.root, &mut ret);
        if !include_stale {
            ret.retain(|contact| !contact.is_stale());
        }
        ret
    }

    /// Returns the number of known remote contacts.
    pub fn total_contacts(&self) -> usize {
        let mut ret = Vec::new();
        self.collect_subtree(self.root, &mut ret);
        ret.len()
    }

    /// Returns the stale remote contacts, the input of the health-check
    /// sweep.
    pub fn stale_contacts(&self) -> Vec<NodeContact> {
        let mut ret = Vec::new();
        self.collect_subtree(self.root, &mut ret);
        ret.retain(|contact| contact.is_stale());
        ret
    }

    /// For every leaf untouched for `BUCKET_REFRESH_INTERVAL`, returns a
    /// random ID inside the leaf's prefix together with the leaf's own
    /// contacts to seed a refresh lookup, and resets the leaf's timer.
    pub fn refresh_targets(&mut self) -> Vec<(NodeId, Vec<NodeContact>)> {
        let threshold = Duration::seconds(BUCKET_REFRESH_INTERVAL as i64);
        let now = SteadyTime::now();
        let mut ret = Vec::new();
        for bucket in &mut self.arena {
            let contacts = match bucket.contacts {
                Some(ref contacts) => contacts,
                None => continue,
            };
            if now - bucket.last_changed <= threshold {
                continue;
            }
            let seed: Vec<NodeContact> = contacts
                .iter()
                .filter(|contact| !contact.is_local)
                .cloned()
                .collect();
            if seed.is_empty() {
                continue;
            }
            ret.push((NodeId::rand_with_prefix(bucket.prefix, bucket.depth), seed));
            bucket.last_changed = now;
        }
        ret
    }

    /// Records a successful RPC answered by `id` at `addr`: refreshes an
    /// existing entry, resolves a bootstrap stub with the same endpoint, or
    /// inserts a brand-new contact.
    pub fn record_success(&mut self, id: NodeId, addr: SocketAddrV4) -> bool {
        if id == self.local_id {
            return false;
        }
        let leaf = self.leaf_for(&id);
        {
            let bucket = &mut self.arena[leaf];
            let contacts = bucket.contacts.as_mut().expect("leaf bucket has contacts");
            if let Some(entry) = contacts
                .iter_mut()
                .find(|entry| entry.id == Some(id) && !entry.is_local)
            {
                entry.record_success(addr);
                bucket.last_changed = SteadyTime::now();
                return true;
            }
        }

        // a stub with this endpoint sits in the local leaf until resolved
        let local_leaf = self.leaf_for(&self.local_id);
        let stub = {
            let contacts = self.arena[local_leaf]
                .contacts
                .as_mut()
                .expect("leaf bucket has contacts");
            contacts
                .iter()
                .position(|entry| entry.id.is_none() && entry.addr == addr)
                .map(|position| contacts.remove(position))
        };
        let mut contact = match stub {
            Some(stub) => stub,
            None => NodeContact::new(id, addr),
        };
        contact.id = Some(id);
        contact.record_success(addr);
        self.add_contact(contact)
    }

    /// Records a failed RPC against the stored entry matching `contact`.
    pub fn record_failure(&mut self, contact: &NodeContact) -> bool {
        let leaf = self.leaf_for(&self.route_id(contact));
        let bucket = &mut self.arena[leaf];
        let contacts = bucket.contacts.as_mut().expect("leaf bucket has contacts");
        match contacts
            .iter_mut()
            .find(|entry| *entry == contact && !entry.is_local)
        {
            Some(entry) => {
                entry.record_failure();
                true
            }
            None => false,
        }
    }

    /// Routing ID of a contact: unresolved stubs route by the local ID.
    fn route_id(&self, contact: &NodeContact) -> NodeId {
        contact.id.unwrap_or(self.local_id)
    }

    /// Descends from the root to the leaf covering `id`.
    fn leaf_for(&self, id: &NodeId) -> usize {
        let mut idx = self.root;
        while let Some((zero, one)) = self.arena[idx].children {
            idx = if id.bit(self.arena[idx].depth) { one } else { zero };
        }
        idx
    }

    /// A full leaf is worth splitting only while some occupant routes away
    /// from `incoming` at a deeper bit, which eventually frees a slot on
    /// `incoming`'s side. Occupants sharing `incoming`'s routing ID stay
    /// with it at every depth, so a leaf holding only those never splits.
    fn splittable(&self, leaf: usize, incoming: &NodeId) -> bool {
        if self.arena[leaf].depth >= ID_LENGTH * 8 {
            return false;
        }
        self.arena[leaf]
            .contacts
            .as_ref()
            .expect("leaf bucket has contacts")
            .iter()
            .any(|existing| self.route_id(existing) != *incoming)
    }

    fn holds_local(&self, leaf: usize) -> bool {
        self.arena[leaf]
            .contacts
            .as_ref()
            .expect("leaf bucket has contacts")
            .iter()
            .any(|contact| contact.is_local)
    }

    /// Splits a leaf into two children partitioned by the next bit of the ID
    /// space. The swap from leaf to internal node happens in one assignment
    /// pair, so a reader always observes one representation or the other.
    fn split(&mut self, idx: usize) {
        let depth = self.arena[idx].depth;
        let prefix = self.arena[idx].prefix;
        let contacts = self.arena[idx]
            .contacts
            .take()
            .expect("split target is a leaf");
        let (ones, zeros): (Vec<NodeContact>, Vec<NodeContact>) = contacts
            .into_iter()
            .partition(|contact| self.route_id(contact).bit(depth));

        let zero_idx = self.alloc(Bucket::leaf(depth + 1, prefix, zeros, Some(idx)));
        let one_prefix = prefix | NodeId::bit_mask(depth);
        let one_idx = self.alloc(Bucket::leaf(depth + 1, one_prefix, ones, Some(idx)));
        self.arena[idx].children = Some((zero_idx, one_idx));
    }

    /// Joins two sibling leaves back into their parent when the combined
    /// contact count fits one bucket. The sibling that does not hold the
    /// local node contributes its contacts first.
    fn try_join(&mut self, parent: usize) {
        let (zero, one) = match self.arena[parent].children {
            Some(children) => children,
            None => return,
        };
        if self.arena[zero].children.is_some() || self.arena[one].children.is_some() {
            return;
        }
        let combined = self.contact_count(zero) + self.contact_count(one);
        if combined > BUCKET_CAPACITY {
            return;
        }

        let (local_side, remote_side) = if self.holds_local(zero) {
            (zero, one)
        } else {
            (one, zero)
        };
        let mut merged = self.arena[remote_side]
            .contacts
            .take()
            .expect("join sibling is a leaf");
        let local_contacts = self.arena[local_side]
            .contacts
            .take()
            .expect("join sibling is a leaf");
        merged.extend(local_contacts);

        let bucket = &mut self.arena[parent];
        bucket.children = None;
        bucket.contacts = Some(merged);
        bucket.last_changed = SteadyTime::now();
        self.free.push(zero);
        self.free.push(one);
    }

    fn contact_count(&self, leaf: usize) -> usize {
        self.arena[leaf]
            .contacts
            .as_ref()
            .expect("leaf bucket has contacts")
            .len()
    }

    fn alloc(&mut self, bucket: Bucket) -> usize {
        match self.free.pop() {
            Some(idx) => {
                self.arena[idx] = bucket;
                idx
            }
            None => {
                self.arena.push(bucket);
                self.arena.len() - 1
            }
        }
    }

    fn collect_leaf(&self, leaf: usize, out: &mut Vec<NodeContact>) {
        if let Some(ref contacts) = self.arena[leaf].contacts {
            out.extend(
                contacts
                    .iter()
                    .filter(|contact| !contact.is_local)
                    .cloned(),
            );
        }
    }

    fn collect_subtree(&self, idx: usize, out: &mut Vec<NodeContact>) {
        match self.arena[idx].children {
            Some((zero, one)) => {
                self.collect_subtree(zero, out);
                self.collect_subtree(one, out);
            }
            None => self.collect_leaf(idx, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RoutingTable;
    use crate::id::NodeId;
    use crate::node::contact::NodeContact;
    use crate::{BUCKET_CAPACITY, ID_LENGTH, MAX_RPC_FAILURES, REPLICATION_PARAM};
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    fn table() -> RoutingTable {
        RoutingTable::new(NodeId::default(), addr(4000))
    }

    /// An ID with the top bit set and a distinguishing low byte.
    fn far_id(n: u8) -> NodeId {
        let mut id = [0u8; ID_LENGTH];
        id[0] = 0x80;
        id[ID_LENGTH - 1] = n;
        NodeId::new(id)
    }

    /// An ID near the all-zero local ID.
    fn near_id(n: u8) -> NodeId {
        let mut id = [0u8; ID_LENGTH];
        id[ID_LENGTH - 1] = n;
        NodeId::new(id)
    }

    fn far_contact(n: u8) -> NodeContact {
        NodeContact::new(far_id(n), addr(5000 + u16::from(n)))
    }

    fn assert_leaf_xor_internal(table: &RoutingTable) {
        let mut stack = vec![table.root];
        while let Some(idx) = stack.pop() {
            let bucket = &table.arena[idx];
            assert_ne!(bucket.contacts.is_some(), bucket.children.is_some());
            if let Some((zero, one)) = bucket.children {
                stack.push(zero);
                stack.push(one);
            }
        }
    }

    fn make_stale(table: &mut RoutingTable, contact: &NodeContact) {
        for _ in 0..MAX_RPC_FAILURES {
            assert!(table.record_failure(contact));
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut table = table();
        assert!(table.add_contact(far_contact(1)));
        assert!(!table.add_contact(far_contact(1)));
        assert_eq!(table.total_contacts(), 1);
    }

    #[test]
    fn test_unresolved_duplicate_by_endpoint() {
        let mut table = table();
        assert!(table.add_contact(NodeContact::unresolved(addr(5001))));
        assert!(!table.add_contact(NodeContact::unresolved(addr(5001))));
        assert_eq!(table.total_contacts(), 1);
    }

    #[test]
    fn test_local_node_is_never_inserted_or_returned() {
        let mut table = table();
        assert!(!table.add_contact(NodeContact::new(NodeId::default(), addr(9000))));
        assert!(table.closest_contacts(&NodeId::default(), 10).is_empty());
        assert_eq!(table.total_contacts(), 0);
    }

    #[test]
    fn test_overflowing_local_leaf_splits() {
        let mut table = table();
        // the root starts with the local contact, so capacity - 1 remote
        // contacts fill it and one more forces a split
        for n in 0..BUCKET_CAPACITY as u8 {
            assert!(table.add_contact(far_contact(n)));
        }
        assert!(table.arena[table.root].children.is_some());
        assert_leaf_xor_internal(&table);

        // the local node ends up in exactly one child
        let (zero, one) = table.arena[table.root].children.unwrap();
        assert!(table.holds_local(zero) ^ table.holds_local(one));
        assert_eq!(table.total_contacts(), BUCKET_CAPACITY);
    }

    #[test]
    fn test_overflowing_stubs_are_rejected_without_splitting() {
        let mut table = table();
        // stubs all route by the local ID, so no amount of splitting can
        // separate them once the local leaf is full
        let mut admitted = 0;
        for n in 0..(BUCKET_CAPACITY as u16 + 4) {
            if table.add_contact(NodeContact::unresolved(addr(5000 + n))) {
                admitted += 1;
            }
        }
        assert_eq!(admitted, BUCKET_CAPACITY - 1);
        assert!(table.arena[table.root].children.is_none());
        assert_eq!(table.total_contacts(), BUCKET_CAPACITY - 1);
    }

    #[test]
    fn test_full_leaf_without_local_rejects() {
        let mut table = table();
        // split the root, leaving the far-side leaf at capacity
        for n in 0..BUCKET_CAPACITY as u8 {
            assert!(table.add_contact(far_contact(n)));
        }
        assert!(!table.add_contact(far_contact(BUCKET_CAPACITY as u8)));
    }

    #[test]
    fn test_full_leaf_evicts_stale_slot_for_live_contact() {
        let mut table = table();
        for n in 0..=BUCKET_CAPACITY as u8 {
            table.add_contact(far_contact(n));
        }
        let victim = far_contact(3);
        make_stale(&mut table, &victim);

        let newcomer = far_contact(BUCKET_CAPACITY as u8 + 1);
        assert!(table.add_contact(newcomer.clone()));
        assert!(table.find_contact(&victim.id.unwrap()).is_none());
        assert!(table.find_contact(&newcomer.id.unwrap()).is_some());
    }

    #[test]
    fn test_stale_contact_never_replaces_live_one() {
        let mut table = table();
        for n in 0..=BUCKET_CAPACITY as u8 {
            table.add_contact(far_contact(n));
        }
        let mut stale_newcomer = far_contact(BUCKET_CAPACITY as u8 + 1);
        for _ in 0..MAX_RPC_FAILURES {
            stale_newcomer.record_failure();
        }
        assert!(!table.add_contact(stale_newcomer));
    }

    #[test]
    fn test_closest_contacts_sorted_and_bounded() {
        let mut table = table();
        for n in 0..BUCKET_CAPACITY as u8 {
            table.add_contact(far_contact(n));
        }
        for n in 1..8u8 {
            table.add_contact(NodeContact::new(near_id(n), addr(6000 + u16::from(n))));
        }

        let target = near_id(1);
        let closest = table.closest_contacts(&target, REPLICATION_PARAM);
        assert!(closest.len() <= REPLICATION_PARAM);
        for pair in closest.windows(2) {
            assert!(pair[0].distance_to(&target) <= pair[1].distance_to(&target));
        }
        assert_eq!(closest[0].id, Some(near_id(1)));
    }

    #[test]
    fn test_remove_refuses_to_shrink_below_replication() {
        let mut table = table();
        for n in 0..REPLICATION_PARAM as u8 {
            table.add_contact(far_contact(n));
        }
        let victim = far_contact(0);
        make_stale(&mut table, &victim);
        assert!(!table.remove_contact(&victim));
        assert_eq!(table.total_contacts(), REPLICATION_PARAM);
    }

    #[test]
    fn test_remove_requires_staleness() {
        let mut table = table();
        for n in 0..=REPLICATION_PARAM as u8 {
            table.add_contact(far_contact(n));
        }
        assert!(!table.remove_contact(&far_contact(0)));
    }

    #[test]
    fn test_remove_evicts_stale_contact_over_replication() {
        let mut table = table();
        for n in 0..=REPLICATION_PARAM as u8 {
            table.add_contact(far_contact(n));
        }
        let victim = far_contact(0);
        make_stale(&mut table, &victim);
        assert!(table.remove_contact(&victim));
        assert_eq!(table.total_contacts(), REPLICATION_PARAM);
    }

    #[test]
    fn test_siblings_join_after_shrinking() {
        let mut table = table();
        for n in 0..=BUCKET_CAPACITY as u8 {
            table.add_contact(far_contact(n));
        }
        assert!(table.arena[table.root].children.is_some());

        // shrink the far-side leaf until both siblings fit the parent again
        let mut n = 0;
        while table.total_contacts() + 1 > BUCKET_CAPACITY {
            let victim = far_contact(n);
            make_stale(&mut table, &victim);
            if !table.remove_contact(&victim) {
                break;
            }
            n += 1;
        }
        assert!(table.arena[table.root].children.is_none());
        assert_leaf_xor_internal(&table);
    }

    #[test]
    fn test_record_success_resolves_bootstrap_stub() {
        let mut table = table();
        table.add_contact(NodeContact::unresolved(addr(5001)));
        let id = far_id(1);
        assert!(table.record_success(id, addr(5001)));
        assert_eq!(table.total_contacts(), 1);
        assert!(table.find_contact(&id).is_some());
    }

    #[test]
    fn test_record_success_inserts_unknown_contact() {
        let mut table = table();
        assert!(table.record_success(far_id(1), addr(5001)));
        assert_eq!(table.total_contacts(), 1);
    }

    #[test]
    fn test_refresh_targets_stay_in_prefix() {
        let mut table = table();
        for n in 0..=BUCKET_CAPACITY as u8 {
            table.add_contact(far_contact(n));
        }
        // freshly-touched buckets are not refresh candidates
        assert!(table.refresh_targets().is_empty());

        let threshold = time::Duration::seconds(crate::BUCKET_REFRESH_INTERVAL as i64 + 1);
        for bucket in &mut table.arena {
            bucket.last_changed = time::SteadyTime::now() - threshold;
        }
        let targets = table.refresh_targets();
        assert!(!targets.is_empty());
        for (id, seed) in targets {
            assert!(!seed.is_empty());
            // the only populated leaf covers the top-bit-set half of the space
            assert!(id.bit(0));
        }
        // timers were reset
        assert!(table.refresh_targets().is_empty());
    }
}
