//! Path index: обратный символьный trie.
//!
//! Пути хранятся задом наперёд, чтобы общие суффиксы (расширения,
//! имена файлов) сидели у корня и ограничивали fan-out. Терминальный
//! узел несёт document id; путь разрешается ровно в один id, повторный
//! bind заменяет привязку.
//!
//! Жизненный цикл узла:
//!   empty -> (child added) internal -> (id assigned) terminal
//!         -> (id cleared, children remain) internal
//!         -> (children removed) empty (pruned)
//!
//! Персист: весь trie сериализуется как один документ — узлы в
//! depth-first порядке, children как отсортированные массивы
//! [char u32][child i32]. Вторичные карты (id -> пути, множество
//! привязанных путей для prefix search) в памяти, восстанавливаются
//! обходом при загрузке.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::error::{Result, StreamDbError};

pub const NO_NODE: i32 = -1;

#[derive(Debug, Clone)]
struct TrieNode {
    value: char,
    parent: i32,
    doc_id: Option<Uuid>,
    children: BTreeMap<char, i32>,
}

impl TrieNode {
    fn new(value: char, parent: i32) -> Self {
        Self {
            value,
            parent,
            doc_id: None,
            children: BTreeMap::new(),
        }
    }
}

pub struct PathIndex {
    // Арена слотов; 0 — корень, прореженные слоты переиспользуются.
    nodes: Vec<Option<TrieNode>>,
    free_slots: Vec<i32>,
    by_id: HashMap<Uuid, BTreeSet<String>>,
    bound: BTreeSet<String>,
}

impl Default for PathIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PathIndex {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(TrieNode::new('\0', NO_NODE))],
            free_slots: Vec::new(),
            by_id: HashMap::new(),
            bound: BTreeSet::new(),
        }
    }

    fn node(&self, idx: i32) -> &TrieNode {
        self.nodes[idx as usize]
            .as_ref()
            .unwrap_or_else(|| unreachable!("dangling trie slot {}", idx))
    }

    fn node_mut(&mut self, idx: i32) -> &mut TrieNode {
        self.nodes[idx as usize]
            .as_mut()
            .unwrap_or_else(|| unreachable!("dangling trie slot {}", idx))
    }

    fn alloc_node(&mut self, value: char, parent: i32) -> i32 {
        if let Some(idx) = self.free_slots.pop() {
            self.nodes[idx as usize] = Some(TrieNode::new(value, parent));
            idx
        } else {
            self.nodes.push(Some(TrieNode::new(value, parent)));
            (self.nodes.len() - 1) as i32
        }
    }

    /// Спуститься по reversed-ключу. None, если путь не представлен.
    fn descend(&self, path: &str) -> Option<i32> {
        let mut cur = 0i32;
        for ch in path.chars().rev() {
            cur = *self.node(cur).children.get(&ch)?;
        }
        Some(cur)
    }

    // ----- mutation -----

    /// Привязать путь к id. Возвращает прежний id, если путь был занят.
    pub fn bind(&mut self, path: &str, id: Uuid) -> Option<Uuid> {
        let mut cur = 0i32;
        for ch in path.chars().rev() {
            cur = match self.node(cur).children.get(&ch) {
                Some(&idx) => idx,
                None => {
                    let idx = self.alloc_node(ch, cur);
                    self.node_mut(cur).children.insert(ch, idx);
                    idx
                }
            };
        }
        let replaced = self.node_mut(cur).doc_id.replace(id);
        if let Some(old) = replaced {
            if old != id {
                self.drop_from_by_id(old, path);
            }
        }
        self.by_id.entry(id).or_default().insert(path.to_string());
        self.bound.insert(path.to_string());
        replaced
    }

    /// Снять привязку пути. Возвращает id, если путь был привязан.
    pub fn unbind(&mut self, path: &str) -> Option<Uuid> {
        let terminal = self.descend(path)?;
        let id = self.node_mut(terminal).doc_id.take()?;
        self.drop_from_by_id(id, path);
        self.bound.remove(path);
        self.prune_upward(terminal);
        Some(id)
    }

    /// Снять привязку, только если путь указывает на данный id.
    pub fn unbind_for(&mut self, id: Uuid, path: &str) -> bool {
        match self.descend(path).and_then(|t| self.node(t).doc_id) {
            Some(bound_id) if bound_id == id => {
                self.unbind(path);
                true
            }
            _ => false,
        }
    }

    /// Снять все привязки id. Возвращает снятые пути.
    pub fn unbind_all(&mut self, id: Uuid) -> Vec<String> {
        let paths: Vec<String> = self
            .by_id
            .get(&id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for p in &paths {
            self.unbind(p);
        }
        paths
    }

    fn drop_from_by_id(&mut self, id: Uuid, path: &str) {
        if let Some(set) = self.by_id.get_mut(&id) {
            set.remove(path);
            if set.is_empty() {
                self.by_id.remove(&id);
            }
        }
    }

    fn prune_upward(&mut self, mut idx: i32) {
        while idx != 0 {
            let (prunable, parent, value) = {
                let n = self.node(idx);
                (n.children.is_empty() && n.doc_id.is_none(), n.parent, n.value)
            };
            if !prunable {
                break;
            }
            self.node_mut(parent).children.remove(&value);
            self.nodes[idx as usize] = None;
            self.free_slots.push(idx);
            idx = parent;
        }
    }

    // ----- queries -----

    pub fn lookup(&self, path: &str) -> Option<Uuid> {
        self.descend(path).and_then(|t| self.node(t).doc_id)
    }

    /// Все привязанные пути, начинающиеся с prefix.
    /// O(log n + |результат|) по упорядоченному множеству путей.
    pub fn search(&self, prefix: &str) -> Vec<String> {
        self.bound
            .range(prefix.to_string()..)
            .take_while(|p| p.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn paths_for(&self, id: Uuid) -> Vec<String> {
        self.by_id
            .get(&id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }

    pub fn bound_paths(&self) -> usize {
        self.bound.len()
    }

    #[cfg(test)]
    fn live_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    // ----- persistence -----

    /// Сериализация в depth-first порядке; индексы узлов — позиции DFS.
    pub fn serialize(&self) -> Vec<u8> {
        // Первый проход: DFS-нумерация живых узлов.
        let mut order: Vec<i32> = Vec::new();
        let mut dfs_of: HashMap<i32, i32> = HashMap::new();
        let mut stack = vec![0i32];
        while let Some(idx) = stack.pop() {
            dfs_of.insert(idx, order.len() as i32);
            order.push(idx);
            // В стек в обратном порядке, чтобы DFS шёл по возрастанию char.
            for &child in self.node(idx).children.values().rev() {
                stack.push(child);
            }
        }

        let mut out = Vec::with_capacity(16 + order.len() * 32);
        let mut b4 = [0u8; 4];
        LittleEndian::write_u32(&mut b4, order.len() as u32);
        out.extend_from_slice(&b4);

        for (dfs_idx, &idx) in order.iter().enumerate() {
            let n = self.node(idx);
            LittleEndian::write_u32(&mut b4, n.value as u32);
            out.extend_from_slice(&b4);
            let parent_dfs = if n.parent == NO_NODE {
                NO_NODE
            } else {
                dfs_of[&n.parent]
            };
            LittleEndian::write_i32(&mut b4, parent_dfs);
            out.extend_from_slice(&b4);
            LittleEndian::write_i32(&mut b4, dfs_idx as i32);
            out.extend_from_slice(&b4);
            match n.doc_id {
                Some(id) => {
                    out.push(1);
                    out.extend_from_slice(id.as_bytes());
                }
                None => out.push(0),
            }
            let mut b2 = [0u8; 2];
            LittleEndian::write_u16(&mut b2, n.children.len() as u16);
            out.extend_from_slice(&b2);
            for (&ch, &child) in &n.children {
                LittleEndian::write_u32(&mut b4, ch as u32);
                out.extend_from_slice(&b4);
                LittleEndian::write_i32(&mut b4, dfs_of[&child]);
                out.extend_from_slice(&b4);
            }
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<PathIndex> {
        fn corrupt(reason: &str) -> StreamDbError {
            StreamDbError::CorruptChain {
                page: NO_NODE,
                reason: format!("path trie: {}", reason),
            }
        }

        fn take<'a>(data: &'a [u8], pos: &mut usize, n: usize) -> Result<&'a [u8]> {
            if *pos + n > data.len() {
                return Err(corrupt("truncated node stream"));
            }
            let s = &data[*pos..*pos + n];
            *pos += n;
            Ok(s)
        }

        let mut pos = 0usize;
        let count = LittleEndian::read_u32(take(data, &mut pos, 4)?) as usize;
        if count == 0 {
            return Ok(PathIndex::new());
        }

        let mut nodes: Vec<Option<TrieNode>> = Vec::with_capacity(count);
        for i in 0..count {
            let value = char::from_u32(LittleEndian::read_u32(take(data, &mut pos, 4)?))
                .ok_or_else(|| corrupt("invalid char value"))?;
            let parent = LittleEndian::read_i32(take(data, &mut pos, 4)?);
            if parent < NO_NODE || parent >= count as i32 {
                return Err(corrupt("parent index out of range"));
            }
            let self_idx = LittleEndian::read_i32(take(data, &mut pos, 4)?);
            if self_idx != i as i32 {
                return Err(corrupt("self index out of order"));
            }
            let has_id = take(data, &mut pos, 1)?[0];
            let doc_id = if has_id == 1 {
                let raw: [u8; 16] = take(data, &mut pos, 16)?
                    .try_into()
                    .map_err(|_| corrupt("bad uuid bytes"))?;
                Some(Uuid::from_bytes(raw))
            } else if has_id == 0 {
                None
            } else {
                return Err(corrupt("bad has_id tag"));
            };
            let child_count = LittleEndian::read_u16(take(data, &mut pos, 2)?) as usize;
            let mut children = BTreeMap::new();
            for _ in 0..child_count {
                let ch = char::from_u32(LittleEndian::read_u32(take(data, &mut pos, 4)?))
                    .ok_or_else(|| corrupt("invalid child char"))?;
                let child = LittleEndian::read_i32(take(data, &mut pos, 4)?);
                if child <= 0 || child as usize >= count {
                    return Err(corrupt("child index out of range"));
                }
                children.insert(ch, child);
            }
            nodes.push(Some(TrieNode {
                value,
                parent,
                doc_id,
                children,
            }));
        }

        let mut index = PathIndex {
            nodes,
            free_slots: Vec::new(),
            by_id: HashMap::new(),
            bound: BTreeSet::new(),
        };
        index.rebuild_maps()?;
        Ok(index)
    }

    /// Восстановить by_id и множество путей обходом дерева.
    fn rebuild_maps(&mut self) -> Result<()> {
        let mut found: Vec<(String, Uuid)> = Vec::new();
        let mut stack: Vec<(i32, String)> = vec![(0, String::new())];
        let mut visited = 0usize;
        while let Some((idx, rev_path)) = stack.pop() {
            visited += 1;
            if visited > self.nodes.len() {
                return Err(StreamDbError::CorruptChain {
                    page: NO_NODE,
                    reason: "path trie: cycle in child links".into(),
                });
            }
            let n = self.node(idx);
            if let Some(id) = n.doc_id {
                // Символы копились от корня — это reversed-путь.
                found.push((rev_path.chars().rev().collect(), id));
            }
            for (&ch, &child) in &n.children {
                let mut next = rev_path.clone();
                next.push(ch);
                stack.push((child, next));
            }
        }
        for (path, id) in found {
            self.by_id.entry(id).or_default().insert(path.clone());
            self.bound.insert(path);
        }
        Ok(())
    }
}
