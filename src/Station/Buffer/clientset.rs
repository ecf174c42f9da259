use std::fmt;

/// The maximum number of client slots a station supports.
/// This must be a constant to allow fixed-size arrays in the shared region.
pub const MAXCLIENTS: usize = 32;

/// Index of a client in the client table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u8);

impl ClientId {
    pub fn new(index: usize) -> Option<Self> {
        (index < MAXCLIENTS).then_some(Self(index as u8))
    }

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A set of clients, stored as one bit per client slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ClientSet(u32);

impl ClientSet {
    pub const EMPTY: ClientSet = ClientSet(0);

    pub fn single(id: ClientId) -> Self {
        Self(1 << id.index())
    }

    #[inline]
    pub fn contains(self, id: ClientId) -> bool {
        self.0 & (1 << id.index()) != 0
    }

    #[inline]
    pub fn insert(&mut self, id: ClientId) {
        self.0 |= 1 << id.index();
    }

    #[inline]
    pub fn remove(&mut self, id: ClientId) {
        self.0 &= !(1 << id.index());
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn union(self, other: ClientSet) -> ClientSet {
        ClientSet(self.0 | other.0)
    }

    pub fn intersection(self, other: ClientSet) -> ClientSet {
        ClientSet(self.0 & other.0)
    }

    pub fn difference(self, other: ClientSet) -> ClientSet {
        ClientSet(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = ClientId> {
        (0..MAXCLIENTS)
            .filter(move |i| self.0 & (1 << i) != 0)
            .filter_map(ClientId::new)
    }
}

impl FromIterator<ClientId> for ClientSet {
    fn from_iter<I: IntoIterator<Item = ClientId>>(iter: I) -> Self {
        let mut set = ClientSet::EMPTY;
        for id in iter {
            set.insert(id);
        }
        set
    }
}

impl fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(ClientId::index)).finish()
    }
}
